//! End-to-end tests for the TCP server and client modes over loopback.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use crossbeam_channel::{unbounded, Receiver};
use nex_network::config::LoggingConfig;
use nex_network::utils::logging::try_init_logging;
use nex_network::{ConnectionType, Data, Engine, EngineConfig, MemberId, NetworkError, Role};
use serde_json::json;
use serial_test::serial;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn setup() {
    try_init_logging(&LoggingConfig::default());
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn port_of(engine: &Engine) -> u16 {
    engine.local_addr().expect("engine is bound").port()
}

/// Server that echoes text back to the sender and reports every event.
fn echo_server(capacity: usize) -> (Engine, Receiver<(MemberId, Data)>) {
    let (tx, rx) = unbounded();
    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    server
        .start_server(0, capacity, move |session, member, data| {
            if let Data::Text(_) = &data {
                session.send(member, &data).unwrap();
            }
            let _ = tx.send((member, data));
        })
        .unwrap();
    (server, rx)
}

fn client(port: u16) -> (Engine, Receiver<Data>) {
    let (tx, rx) = unbounded();
    let engine = Engine::init(ConnectionType::Tcp, Role::Client).unwrap();
    engine
        .connect_to_server("127.0.0.1", port, move |_, _, data| {
            let _ = tx.send(data);
        })
        .unwrap();
    (engine, rx)
}

fn next<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(WAIT).expect("event within timeout")
}

#[test]
fn echo_round_trip() {
    setup();
    let (server, server_events) = echo_server(4);
    let (client, client_events) = client(port_of(&server));

    assert_eq!(next(&client_events), Data::Connected);
    let (member, event) = next(&server_events);
    assert_eq!(event, Data::Connected);

    client.send_to_server(&Data::from("hello, socket!")).unwrap();

    assert_eq!(next(&server_events), (member, Data::from("hello, socket!")));
    assert_eq!(next(&client_events), Data::from("hello, socket!"));

    client.shutdown().unwrap();
    assert_eq!(next(&server_events), (member, Data::Disconnected));
    server.shutdown().unwrap();
}

#[test]
fn numeric_values_cross_the_wire_exactly() {
    setup();
    let (tx, rx) = unbounded();
    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    server
        .start_server(0, 1, move |_, _, data| {
            if !data.is_notification() {
                let _ = tx.send(data);
            }
        })
        .unwrap();
    let (client, _events) = client(port_of(&server));

    client.send_to_server(&Data::Int(i32::MIN)).unwrap();
    client.send_to_server(&Data::Float(-0.0)).unwrap();
    client.send_to_server(&Data::Float(f32::MAX)).unwrap();

    assert_eq!(next(&rx), Data::Int(i32::MIN));
    match next(&rx) {
        Data::Float(v) => assert_eq!(v.to_bits(), (-0.0f32).to_bits()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(next(&rx), Data::Float(f32::MAX));
}

#[test]
fn document_round_trip() {
    setup();
    let (server, server_events) = echo_server(2);
    let (client, _client_events) = client(port_of(&server));
    assert_eq!(next(&server_events).1, Data::Connected);

    client
        .send_to_server(&Data::from(json!({"message": "hello", "value": 123})))
        .unwrap();

    let (_, data) = next(&server_events);
    let doc = data.as_document().expect("document value");
    assert_eq!(doc["message"], "hello");
    assert_eq!(doc["value"], 123);
}

#[test]
#[serial]
fn capacity_rejects_extra_client_without_disturbing_others() {
    setup();
    let (server, _server_events) = echo_server(2);
    let port = port_of(&server);

    let (first, first_events) = client(port);
    let (second, second_events) = client(port);
    wait_for("two members", || server.member_count() == 2);

    let (_third, third_events) = client(port);
    assert_eq!(next(&third_events), Data::Connected);
    assert_eq!(next(&third_events), Data::Disconnected);

    assert_eq!(server.member_count(), 2);
    assert_eq!(server.metrics().members_rejected, 1);
    let last = server.last_error().expect("capacity recorded");
    assert!(last.contains("Capacity reached"), "last error: {last}");

    assert_eq!(next(&first_events), Data::Connected);
    assert_eq!(next(&second_events), Data::Connected);
    first.send_to_server(&Data::from("one")).unwrap();
    second.send_to_server(&Data::from("two")).unwrap();
    assert_eq!(next(&first_events), Data::from("one"));
    assert_eq!(next(&second_events), Data::from("two"));
}

struct Counter {
    count: i32,
    drops: Arc<AtomicUsize>,
}

impl Drop for Counter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn context_lifecycle() {
    setup();
    let drops = Arc::new(AtomicUsize::new(0));
    let (gone_tx, gone_rx) = unbounded();

    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    let handler_drops = Arc::clone(&drops);
    server
        .start_server(0, 2, move |session, member, data| match data {
            Data::Connected => {
                let counter = Counter {
                    count: 0,
                    drops: Arc::clone(&handler_drops),
                };
                session.set_context(member, counter).unwrap();
            }
            Data::Text(_) => {
                let counter = session.context_mut::<Counter>(member).expect("context set");
                counter.count += 1;
                let count = counter.count;
                session.send(member, &Data::Int(count)).unwrap();
            }
            Data::Disconnected => {
                assert!(session.context::<Counter>(member).is_none());
                let _ = gone_tx.send(handler_drops.load(Ordering::SeqCst));
            }
            _ => {}
        })
        .unwrap();

    let (client, events) = client(port_of(&server));
    assert_eq!(next(&events), Data::Connected);

    for expected in 1..=3 {
        client.send_to_server(&Data::from("tick")).unwrap();
        assert_eq!(next(&events), Data::Int(expected));
    }

    let member = server.members().unwrap()[0];
    assert_eq!(server.with_client_context(member, |c: &mut Counter| c.count), Some(3));
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    client.shutdown().unwrap();
    assert_eq!(next(&gone_rx), 1, "context dropped exactly once before Disconnected");
    server.shutdown().unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn facade_context_api() {
    setup();
    let (server, server_events) = echo_server(2);
    let (_client, _events) = client(port_of(&server));
    let (member, _) = next(&server_events);

    assert_eq!(server.client_context::<String>(member), None);
    assert!(server.last_error().unwrap().contains("no context"));

    server.set_client_context(member, String::from("alice")).unwrap();
    assert_eq!(server.client_context::<String>(member).as_deref(), Some("alice"));
    assert_eq!(server.client_context::<u64>(member), None);

    server.set_client_context(member, String::from("bob")).unwrap();
    assert_eq!(server.take_client_context::<String>(member).as_deref(), Some("bob"));
    assert_eq!(server.take_client_context::<String>(member), None);

    let unknown = MemberId::from_raw(u64::MAX);
    assert!(matches!(
        server.set_client_context(unknown, 1u8),
        Err(NetworkError::UnknownMember(_))
    ));
}

#[test]
#[serial]
fn callbacks_never_overlap() {
    setup();
    const PER_CLIENT: usize = 50;

    let inside = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let received = Arc::new(AtomicUsize::new(0));

    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    {
        let inside = Arc::clone(&inside);
        let overlapped = Arc::clone(&overlapped);
        let received = Arc::clone(&received);
        server
            .start_server(0, 2, move |_, _, data| {
                if inside.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_micros(200));
                if let Data::Int(_) = data {
                    received.fetch_add(1, Ordering::SeqCst);
                }
                inside.store(false, Ordering::SeqCst);
            })
            .unwrap();
    }

    let port = port_of(&server);
    let senders: Vec<_> = (0..2)
        .map(|n| {
            thread::spawn(move || {
                let (client, _events) = client(port);
                for i in 0..PER_CLIENT {
                    client.send_to_server(&Data::Int((n * 1000 + i) as i32)).unwrap();
                }
                client
            })
        })
        .collect();
    let clients: Vec<Engine> = senders.into_iter().map(|h| h.join().unwrap()).collect();

    wait_for("all frames", || received.load(Ordering::SeqCst) == 2 * PER_CLIENT);
    assert!(!overlapped.load(Ordering::SeqCst), "two callbacks ran at once");
    drop(clients);
}

#[test]
#[serial]
fn shutdown_waits_for_every_worker() {
    setup();
    let disconnected = Arc::new(AtomicUsize::new(0));
    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    {
        let disconnected = Arc::clone(&disconnected);
        server
            .start_server(0, 8, move |_, _, data| {
                if data == Data::Disconnected {
                    disconnected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    let port = port_of(&server);
    let clients: Vec<_> = (0..5).map(|_| client(port)).collect();
    wait_for("five members", || server.member_count() == 5);

    server.shutdown().unwrap();

    assert_eq!(server.member_count(), 0);
    assert_eq!(disconnected.load(Ordering::SeqCst), 5);
    assert!(!server.is_running());
    assert!(server.members().is_err());

    for (_, events) in &clients {
        assert_eq!(next(events), Data::Connected);
        assert_eq!(next(events), Data::Disconnected);
    }

    // idempotent
    server.shutdown().unwrap();
}

#[test]
fn broadcast_skips_the_sender() {
    setup();
    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    server
        .start_server(0, 4, |session, member, data| {
            if let Data::Text(_) = &data {
                session.broadcast(&data, member).unwrap();
            }
        })
        .unwrap();
    let port = port_of(&server);

    let (alice, alice_events) = client(port);
    let (_bob, bob_events) = client(port);
    let (_carol, carol_events) = client(port);
    wait_for("three members", || server.member_count() == 3);
    for events in [&alice_events, &bob_events, &carol_events] {
        assert_eq!(next(events), Data::Connected);
    }

    alice.send_to_server(&Data::from("hi all")).unwrap();
    assert_eq!(next(&bob_events), Data::from("hi all"));
    assert_eq!(next(&carol_events), Data::from("hi all"));
    assert!(alice_events.recv_timeout(Duration::from_millis(200)).is_err());

    assert_eq!(server.send_to_all_clients(&Data::Int(7)).unwrap(), 3);
    for events in [&alice_events, &bob_events, &carol_events] {
        assert_eq!(next(events), Data::Int(7));
    }

    let first = server.members().unwrap()[0];
    assert_eq!(server.broadcast_to_clients(&Data::Int(8), first).unwrap(), 2);
}

#[test]
fn facade_refuses_reentrant_calls() {
    setup();
    let (tx, rx) = unbounded();
    let server = Arc::new(Engine::init(ConnectionType::Tcp, Role::Server).unwrap());
    let weak = Arc::downgrade(&server);
    server
        .start_server(0, 1, move |session, member, data| {
            if data != Data::Connected {
                return;
            }
            let Some(engine) = weak.upgrade() else { return };
            let send = engine.send_to_client(member, &Data::Int(1));
            let stop = engine.shutdown();
            let count = engine.member_count();
            let _ = tx.send((
                matches!(send, Err(NetworkError::Reentrant)),
                matches!(stop, Err(NetworkError::Reentrant)),
                count,
                session.member_count(),
            ));
        })
        .unwrap();

    let (_client, _events) = client(port_of(&server));
    assert_eq!(next(&rx), (true, true, 1, 1));
    assert!(server.is_running());
    server.shutdown().unwrap();
}

#[test]
fn server_side_disconnect() {
    setup();
    let (server, server_events) = echo_server(2);
    let (client, client_events) = client(port_of(&server));
    let (member, _) = next(&server_events);
    assert_eq!(next(&client_events), Data::Connected);

    server.disconnect(member).unwrap();
    assert_eq!(next(&server_events), (member, Data::Disconnected));
    assert_eq!(next(&client_events), Data::Disconnected);
    assert_eq!(server.member_count(), 0);

    assert!(matches!(
        server.send_to_client(member, &Data::Int(1)),
        Err(NetworkError::UnknownMember(_))
    ));
    assert!(matches!(
        client.send_to_server(&Data::Int(1)),
        Err(NetworkError::ConnectionClosed)
    ));
}

#[test]
fn panicking_callback_keeps_worker_alive() {
    setup();
    let (tx, rx) = unbounded();
    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    server
        .start_server(0, 1, move |_, _, data| {
            if data == Data::Int(13) {
                panic!("unlucky");
            }
            let _ = tx.send(data);
        })
        .unwrap();

    let (client, _events) = client(port_of(&server));
    assert_eq!(next(&rx), Data::Connected);

    client.send_to_server(&Data::Int(13)).unwrap();
    client.send_to_server(&Data::Int(14)).unwrap();
    assert_eq!(next(&rx), Data::Int(14));
    assert!(server.last_error().unwrap().contains("panicked"));
}

#[test]
fn restart_keeps_ids_increasing() {
    setup();
    let (server, server_events) = echo_server(1);
    let (first_client, _) = client(port_of(&server));
    let (first_id, _) = next(&server_events);
    server.shutdown().unwrap();
    drop(first_client);
    let _ = next(&server_events);

    let ids = Arc::new(Mutex::new(Vec::new()));
    {
        let ids = Arc::clone(&ids);
        server
            .start_server(0, 1, move |_, member, data| {
                if data == Data::Connected {
                    ids.lock().unwrap().push(member);
                }
            })
            .unwrap();
    }
    let (_second_client, _) = client(port_of(&server));
    wait_for("second run member", || !ids.lock().unwrap().is_empty());

    let second_id = ids.lock().unwrap()[0];
    assert!(second_id > first_id);
}

#[test]
fn start_twice_is_rejected() {
    setup();
    let (server, _events) = echo_server(1);
    let err = server.start_server(0, 1, |_, _, _| {}).unwrap_err();
    assert!(matches!(err, NetworkError::InvalidState(_)));
    assert!(server.is_running());
}

#[test]
fn connect_refused_leaves_engine_idle() {
    setup();
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let engine = Engine::init(ConnectionType::Tcp, Role::Client).unwrap();
    let err = engine
        .connect_to_server("127.0.0.1", port, |_, _, _| {})
        .unwrap_err();
    assert!(matches!(err, NetworkError::Connect { .. }), "got {err:?}");
    assert!(!engine.is_running());
    assert!(engine.last_error().is_some());
}

#[test]
fn bind_conflict_reports_bind_stage() {
    setup();
    let (server, _events) = echo_server(1);
    let taken = port_of(&server);

    let other = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    let err = other.start_server(taken, 1, |_, _, _| {}).unwrap_err();
    assert!(matches!(err, NetworkError::Bind { .. }), "got {err:?}");
    assert!(!other.is_running());
}

#[test]
fn session_reports_member_details() {
    setup();
    let (tx, rx) = unbounded();
    let server = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
    server
        .start_server(0, 3, move |session, member, data| match data {
            Data::Connected => {
                let remote = session.remote_addr(member).unwrap();
                session.set_context(member, String::from("greeting")).unwrap();
                let cleared = session.clear_context(member);
                let cleared_again = session.clear_context(member);
                let _ = tx.send((session.capacity(), remote.ip().is_loopback(), cleared, cleared_again));
            }
            Data::Text(text) => session.record_error(format!("rejected {text}")),
            _ => {}
        })
        .unwrap();

    let (client, client_events) = client(port_of(&server));
    assert_eq!(next(&client_events), Data::Connected);
    assert_eq!(next(&rx), (3, true, true, false));

    client.send_to_server(&Data::from("bad input")).unwrap();
    wait_for("application error", || {
        server.last_error().as_deref() == Some("rejected bad input")
    });
}

/// Large enough to fill both loopback socket buffers of a peer that never reads.
const FLOOD: usize = 12 * 1024 * 1024;

#[test]
#[serial]
fn shutdown_completes_while_a_callback_write_is_stalled() {
    setup();
    let config = EngineConfig::default_with_overrides(|c| c.transport.write_timeout = None);
    let server = Arc::new(Engine::with_config(ConnectionType::Tcp, Role::Server, config).unwrap());
    let (tx, rx) = unbounded();
    server
        .start_server(0, 2, move |session, member, data| {
            if data == Data::Connected {
                let _ = tx.send(());
                let _ = session.send(member, &Data::Text("x".repeat(FLOOD)));
            }
        })
        .unwrap();

    let stalled = TcpStream::connect(("127.0.0.1", port_of(&server))).unwrap();
    next(&rx);
    thread::sleep(Duration::from_millis(200));

    let (done_tx, done_rx) = unbounded();
    let engine = Arc::clone(&server);
    thread::spawn(move || {
        let _ = done_tx.send(engine.shutdown());
    });

    let result = done_rx
        .recv_timeout(WAIT)
        .expect("shutdown returns while a callback write is blocked");
    assert!(result.is_ok());
    assert!(!server.is_running());
    assert_eq!(server.member_count(), 0);
    drop(stalled);
}

#[test]
fn stalled_reader_hits_write_timeout() {
    setup();
    let config = EngineConfig::default_with_overrides(|c| {
        c.transport.write_timeout = Some(Duration::from_millis(200))
    });
    let server = Engine::with_config(ConnectionType::Tcp, Role::Server, config).unwrap();
    let (tx, events) = unbounded();
    server
        .start_server(0, 2, move |_, member, data| {
            let _ = tx.send((member, data));
        })
        .unwrap();

    let _stalled = TcpStream::connect(("127.0.0.1", port_of(&server))).unwrap();
    let (id, event) = next(&events);
    assert_eq!(event, Data::Connected);

    let err = server
        .send_to_client(id, &Data::Text("x".repeat(FLOOD)))
        .unwrap_err();
    assert!(matches!(err, NetworkError::Send(_)), "got {err:?}");
    assert_eq!(server.metrics().send_errors, 1);

    // a half-written frame ends the member
    assert_eq!(next(&events), (id, Data::Disconnected));
}

#[test]
fn context_closure_refuses_facade_calls() {
    setup();
    let (server, events) = echo_server(2);
    let (_client, client_events) = client(port_of(&server));
    assert_eq!(next(&client_events), Data::Connected);
    let (id, _) = next(&events);

    server.set_client_context(id, 1u32).unwrap();
    let (send, members) = server
        .with_client_context(id, |n: &mut u32| {
            *n += 1;
            (server.send_to_client(id, &Data::Int(1)), server.members())
        })
        .unwrap();
    assert!(matches!(send, Err(NetworkError::Reentrant)));
    assert!(matches!(members, Err(NetworkError::Reentrant)));

    assert_eq!(server.client_context::<u32>(id), Some(2));
    assert!(server.send_to_client(id, &Data::Int(1)).is_ok());
}

#[test]
fn dropping_the_last_handle_inside_a_callback() {
    setup();
    let slot: Arc<Mutex<Option<Arc<Engine>>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = unbounded();
    let server = Arc::new(Engine::init(ConnectionType::Tcp, Role::Server).unwrap());
    {
        let slot = Arc::clone(&slot);
        server
            .start_server(0, 2, move |_, _, data| {
                if data.as_text() == Some("stop") {
                    let last = slot.lock().unwrap().take();
                    drop(last);
                    let _ = tx.send(());
                }
            })
            .unwrap();
    }
    let port = port_of(&server);
    *slot.lock().unwrap() = Some(server);

    let (client, client_events) = client(port);
    assert_eq!(next(&client_events), Data::Connected);
    client.send_to_server(&Data::from("stop")).unwrap();

    next(&rx);
    assert_eq!(next(&client_events), Data::Disconnected);
}
