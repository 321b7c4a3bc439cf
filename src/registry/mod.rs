//! # Member Registry
//!
//! Bounded table of connected members plus the threads that serve them.
//!
//! ## Threads
//! - **Accept loop** (TCP server): polls a non-blocking listener and admits
//!   connections up to capacity
//! - **Datagram loop** (UDP peer): owns the receive side of the peer socket and
//!   routes each datagram to the sending peer's inbox
//! - **Workers**: one per member, block on input and deliver values
//! - **Reaper**: joins finished workers and removes their members
//!
//! All callbacks run with the registry lock held, so at most one executes at
//! any time across the whole engine.

mod context;
pub mod member;
pub mod session;
mod worker;

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::codec::FrameCodec;
use crate::core::Data;
use crate::engine::Mode;
use crate::error::constants::{ERR_LOCK_POISONED, ERR_NOT_RUNNING};
use crate::error::{NetworkError, Result};
use crate::transport::{self, tcp, udp};
use crate::utils::{LastError, Metrics};

pub use member::{MemberId, MemberState};
pub use session::Session;

pub(crate) use worker::in_callback;

use member::{Control, Member, MemberTable, Outbound};
use worker::{CallbackScope, DatagramInbound, Inbound, ReaperMsg, StreamInbound};

/// Callback invoked for every Connected, data and Disconnected event.
pub type Handler = Box<dyn FnMut(&mut Session<'_>, MemberId, Data) + Send + 'static>;

/// Engine-lifetime state shared by every run of an engine.
#[derive(Clone)]
pub(crate) struct Resources {
    pub(crate) mode: Mode,
    pub(crate) config: EngineConfig,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) last_error: Arc<LastError>,
    pub(crate) ids: Arc<AtomicU64>,
}

struct Registry {
    members: MemberTable,
    handler: Handler,
}

/// State shared between the facade and every engine thread for one run.
pub(crate) struct Shared {
    pub(crate) mode: Mode,
    pub(crate) config: EngineConfig,
    pub(crate) codec: FrameCodec,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) last_error: Arc<LastError>,
    ids: Arc<AtomicU64>,
    running: AtomicBool,
    registry: Mutex<Registry>,
    reaper: Sender<ReaperMsg>,
    datagrams: Option<Arc<UdpSocket>>,
    /// Shutdown handles of TCP members, reachable without the registry lock.
    links: Mutex<Vec<(MemberId, Arc<TcpStream>)>>,
}

impl Shared {
    fn new(
        resources: &Resources,
        capacity: usize,
        handler: Handler,
        datagrams: Option<Arc<UdpSocket>>,
    ) -> (Arc<Self>, Receiver<ReaperMsg>) {
        let (reaper, exits) = crossbeam_channel::unbounded();
        let shared = Arc::new(Self {
            mode: resources.mode,
            config: resources.config.clone(),
            codec: FrameCodec::with_max_payload(resources.config.transport.max_payload_size),
            metrics: resources.metrics.clone(),
            last_error: resources.last_error.clone(),
            ids: resources.ids.clone(),
            running: AtomicBool::new(true),
            registry: Mutex::new(Registry {
                members: MemberTable::new(capacity),
                handler,
            }),
            reaper,
            datagrams,
            links: Mutex::new(Vec::new()),
        });
        (shared, exits)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            warn!("{ERR_LOCK_POISONED}: recovering member registry");
            poisoned.into_inner()
        })
    }

    fn lock_links(&self) -> MutexGuard<'_, Vec<(MemberId, Arc<TcpStream>)>> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn forget_link(&self, id: MemberId) {
        self.lock_links().retain(|(member, _)| *member != id);
    }

    /// Shut down every TCP member's socket without touching the registry.
    ///
    /// Unblocks reads and writes in progress, including a write made by a
    /// callback that holds the registry lock.
    fn sever_links(&self) {
        for (id, stream) in self.lock_links().iter() {
            debug!(member = %id, "Severing link");
            tcp::close(stream);
        }
    }

    fn next_id(&self) -> MemberId {
        MemberId::from_raw(self.ids.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn member_count(&self) -> usize {
        self.lock_registry().members.len()
    }

    pub(crate) fn member_ids(&self) -> Vec<MemberId> {
        self.lock_registry().members.ids()
    }

    pub(crate) fn member_state(&self, id: MemberId) -> Option<MemberState> {
        self.lock_registry().members.get(id).map(|m| m.state)
    }

    /// Write failures into the last-error slot on their way out.
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error.record(e.to_string());
        }
        result
    }

    /// Run `f` against the registry outside any callback.
    ///
    /// `f` may run application code, so the thread is marked as holding the
    /// lock and facade calls made from it fail with `Reentrant`.
    pub(crate) fn with_session<R>(&self, f: impl FnOnce(&mut Session<'_>) -> R) -> R {
        let mut registry = self.lock_registry();
        let _scope = CallbackScope::enter();
        let mut session = Session::new(&mut registry.members, self);
        f(&mut session)
    }

    fn spawn_worker(self: &Arc<Self>, id: MemberId, inbound: Box<dyn Inbound>) -> Result<JoinHandle<()>> {
        let shared = Arc::clone(self);
        thread::Builder::new()
            .name(format!("nex-member-{}", id.get()))
            .spawn(move || worker::run_member(shared, id, inbound))
            .map_err(NetworkError::Thread)
    }

    /// Insert a member and start its worker, undoing the insert on failure.
    fn enlist(self: &Arc<Self>, members: &mut MemberTable, member: Member, inbound: Box<dyn Inbound>) -> Result<()> {
        let id = member.id;
        members.insert(member)?;
        match self.spawn_worker(id, inbound) {
            Ok(handle) => {
                if let Some(member) = members.get_mut(id) {
                    member.worker = Some(handle);
                }
                self.metrics.member_added();
                Ok(())
            }
            Err(e) => {
                members.remove(id);
                Err(e)
            }
        }
    }

    /// Register a connected stream as a member.
    pub(crate) fn admit_stream(self: &Arc<Self>, stream: TcpStream) -> Result<MemberId> {
        let result = self.try_admit_stream(stream);
        self.track(result)
    }

    fn try_admit_stream(self: &Arc<Self>, stream: TcpStream) -> Result<MemberId> {
        let transport = &self.config.transport;
        tcp::prepare(&stream, transport.nodelay, transport.write_timeout)?;

        let mut registry = self.lock_registry();
        if !self.is_running() {
            tcp::close(&stream);
            return Err(NetworkError::InvalidState(ERR_NOT_RUNNING));
        }
        if registry.members.is_full() {
            let err = NetworkError::CapacityReached {
                limit: registry.members.capacity(),
            };
            self.metrics.member_rejected();
            self.last_error.record(err.to_string());
            tcp::close(&stream);
            return Err(err);
        }

        let parts = tcp::split(stream)?;
        let id = self.next_id();
        let remote = parts.peer_addr;
        let control = Arc::new(parts.control);
        let member = Member::new(
            id,
            remote,
            Outbound::Tcp(Arc::new(Mutex::new(parts.writer))),
            Control::Tcp(Arc::clone(&control)),
        );
        let inbound = StreamInbound::new(parts.reader, self.codec.max_payload());
        self.enlist(&mut registry.members, member, Box::new(inbound))?;
        self.lock_links().push((id, control));

        info!(member = %id, %remote, active = registry.members.len(), "Connection registered");
        Ok(id)
    }

    /// Register a remote peer address.
    pub(crate) fn add_peer(self: &Arc<Self>, remote: SocketAddr) -> Result<MemberId> {
        let result = self.try_add_peer(remote);
        self.track(result)
    }

    fn try_add_peer(self: &Arc<Self>, remote: SocketAddr) -> Result<MemberId> {
        let mut registry = self.lock_registry();
        if !self.is_running() {
            return Err(NetworkError::InvalidState(ERR_NOT_RUNNING));
        }
        if registry.members.find_by_remote(remote).is_some() {
            return Err(NetworkError::InvalidArgument(format!(
                "peer {remote} is already registered"
            )));
        }
        if registry.members.is_full() {
            self.metrics.member_rejected();
            return Err(NetworkError::CapacityReached {
                limit: registry.members.capacity(),
            });
        }

        let (inbox, queue) = crossbeam_channel::bounded(self.config.peer.inbox_capacity);
        let id = self.next_id();
        let member = Member::new(id, remote, Outbound::Udp(remote), Control::Udp(Some(inbox)));
        let inbound = DatagramInbound::new(queue, self.codec);
        self.enlist(&mut registry.members, member, Box::new(inbound))?;

        info!(member = %id, %remote, active = registry.members.len(), "Peer registered");
        Ok(id)
    }

    fn route_datagram(&self, from: SocketAddr, datagram: Bytes) {
        let registry = self.lock_registry();
        let Some(inbox) = registry.members.find_by_remote(from).and_then(Member::inbox) else {
            debug!(%from, bytes = datagram.len(), "Datagram from unregistered peer dropped");
            return;
        };
        match inbox.try_send(datagram) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(%from, "Peer inbox full, datagram dropped"),
            Err(TrySendError::Disconnected(_)) => debug!(%from, "Peer closing, datagram dropped"),
        }
    }

    /// Send handle for one member, cloned so the send runs outside the lock.
    pub(crate) fn outbound(&self, id: MemberId) -> Result<Outbound> {
        self.lock_registry()
            .members
            .get(id)
            .map(|m| m.outbound.clone())
            .ok_or(NetworkError::UnknownMember(id.get()))
    }

    pub(crate) fn targets(&self, exclude: Option<MemberId>) -> Vec<(MemberId, Outbound)> {
        self.lock_registry().members.targets(exclude)
    }

    /// Encode and send one value.
    pub(crate) fn transmit(&self, id: MemberId, outbound: &Outbound, data: &Data) -> Result<()> {
        let frame = self.codec.to_bytes(data)?;
        self.write_frame(id, outbound, &frame)
    }

    fn write_frame(&self, id: MemberId, outbound: &Outbound, frame: &[u8]) -> Result<()> {
        let written = match outbound {
            Outbound::Tcp(writer) => {
                let mut stream = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let result = stream.write_all(frame).and_then(|()| stream.flush());
                if result.is_err() {
                    // a partial frame leaves the stream out of sync; end the member
                    tcp::close(&stream);
                }
                result
                    .map(|()| frame.len())
                    .map_err(|e| NetworkError::Send(format!("member {id}: {e}")))
            }
            Outbound::Udp(remote) => match &self.datagrams {
                Some(socket) => udp::send(socket, *remote, frame, self.config.peer.max_datagram_size),
                None => Err(NetworkError::InvalidState(ERR_NOT_RUNNING)),
            },
        };

        match written {
            Ok(n) => {
                self.metrics.frame_sent(n as u64);
                Ok(())
            }
            Err(e) => {
                self.metrics.send_error();
                Err(e)
            }
        }
    }

    /// Best-effort send to every target, each attempted once.
    ///
    /// Returns the number of successful sends; if any failed, the error
    /// summarizes the failures and the last one is recorded.
    pub(crate) fn fan_out(&self, targets: Vec<(MemberId, Outbound)>, data: &Data) -> Result<usize> {
        let frame = self.track(self.codec.to_bytes(data))?;
        let attempted = targets.len();
        let mut delivered = 0;
        let mut last_failure = None;

        for (id, outbound) in &targets {
            match self.write_frame(*id, outbound, &frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(member = %id, error = %e, "Fan-out send failed");
                    last_failure = Some(e);
                }
            }
        }

        match last_failure {
            None => Ok(delivered),
            Some(e) => {
                let failed = attempted - delivered;
                let err = NetworkError::Send(format!("{failed} of {attempted} sends failed; last: {e}"));
                self.last_error.record(err.to_string());
                Err(err)
            }
        }
    }

    pub(crate) fn disconnect(&self, id: MemberId) -> Result<()> {
        self.with_session(|session| session.disconnect(id))
    }

    fn close_all(&self) {
        let mut registry = self.lock_registry();
        for member in registry.members.iter_mut() {
            member.request_close();
        }
    }
}

/// Threads and handles for one running engine.
pub(crate) struct Runtime {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    pump: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl Runtime {
    fn new(shared: Arc<Shared>, local_addr: SocketAddr) -> Self {
        Self {
            shared,
            local_addr,
            pump: None,
            reaper: None,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn start_reaper(&mut self, exits: Receiver<ReaperMsg>) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.reaper = Some(spawn_named("nex-reaper", move || worker::run_reaper(shared, exits))?);
        Ok(())
    }

    /// Stop every thread and remove every member. Idempotent.
    pub(crate) fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(local = %self.local_addr, "Stopping engine");

        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                error!("Listener thread panicked");
            }
        }

        self.shared.sever_links();
        self.shared.close_all();

        if let Some(reaper) = self.reaper.take() {
            if self.shared.reaper.send(ReaperMsg::Drain).is_err() {
                warn!("Reaper already stopped");
            }
            if reaper.join().is_err() {
                error!("Reaper thread panicked");
            }
        }

        self.shared.metrics.log_metrics();
        info!("Engine stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_named<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(NetworkError::Thread)
}

/// Bind, listen and start accepting clients.
pub(crate) fn serve(resources: &Resources, port: u16, capacity: usize, handler: Handler) -> Result<Runtime> {
    let server = &resources.config.server;
    let addr = transport::resolve(&server.bind_address, port)?;
    let listener = tcp::listen(addr, server.backlog)?;
    let local_addr = listener.local_addr().map_err(NetworkError::Socket)?;

    let (shared, exits) = Shared::new(resources, capacity, handler, None);
    let mut runtime = Runtime::new(Arc::clone(&shared), local_addr);
    runtime.start_reaper(exits)?;
    runtime.pump = Some(spawn_named("nex-accept", move || run_accept_loop(shared, listener))?);

    info!(%local_addr, capacity, "TCP server listening");
    Ok(runtime)
}

/// Connect to a server and register it as the only member.
pub(crate) fn connect(resources: &Resources, host: &str, port: u16, handler: Handler) -> Result<Runtime> {
    let addr = transport::resolve(host, port)?;
    let stream = tcp::connect(addr, resources.config.client.connect_timeout)?;
    let local_addr = stream.local_addr().map_err(NetworkError::Socket)?;

    let (shared, exits) = Shared::new(resources, 1, handler, None);
    let mut runtime = Runtime::new(Arc::clone(&shared), local_addr);
    runtime.start_reaper(exits)?;
    let id = shared.admit_stream(stream)?;

    info!(server = %addr, member = %id, "Connected to server");
    Ok(runtime)
}

/// Bind the peer socket and start routing datagrams.
pub(crate) fn mesh(resources: &Resources, port: u16, capacity: usize, handler: Handler) -> Result<Runtime> {
    let peer = &resources.config.peer;
    let addr = transport::resolve(&peer.bind_address, port)?;
    let socket = Arc::new(udp::bind(addr, peer.poll_interval)?);
    let local_addr = socket.local_addr().map_err(NetworkError::Socket)?;

    let (shared, exits) = Shared::new(resources, capacity, handler, Some(Arc::clone(&socket)));
    let mut runtime = Runtime::new(Arc::clone(&shared), local_addr);
    runtime.start_reaper(exits)?;
    runtime.pump = Some(spawn_named("nex-datagram", move || run_datagram_loop(shared, socket))?);

    info!(%local_addr, capacity, "UDP peer listening");
    Ok(runtime)
}

fn run_accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let poll = shared.config.server.accept_poll_interval;
    debug!("Accept loop started");

    while shared.is_running() {
        match listener.accept() {
            Ok((stream, remote)) => {
                if let Err(e) = shared.admit_stream(stream) {
                    warn!(%remote, error = %e, "Connection not admitted");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                let err = NetworkError::Accept(e);
                error!(error = %err, "Accept failed");
                shared.metrics.connection_error();
                shared.last_error.record(err.to_string());
                thread::sleep(poll);
            }
        }
    }

    debug!("Accept loop stopped");
}

fn run_datagram_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; shared.config.peer.max_datagram_size];
    debug!("Datagram loop started");

    while shared.is_running() {
        match udp::recv(&socket, &mut buf) {
            Ok(Some((len, from))) => {
                shared.route_datagram(from, Bytes::copy_from_slice(&buf[..len]));
            }
            Ok(None) => {}
            Err(e) => {
                if !shared.is_running() {
                    break;
                }
                warn!(error = %e, "Datagram receive failed");
                shared.metrics.connection_error();
                shared.last_error.record(e.to_string());
                thread::sleep(shared.config.peer.poll_interval);
            }
        }
    }

    debug!("Datagram loop stopped");
}
