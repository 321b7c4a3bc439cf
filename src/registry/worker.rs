//! Per-member receive workers, callback delivery and the reaper.
//!
//! A worker blocks on its member's input outside the registry lock and takes
//! the lock only to deliver a value. When it exits, a notice goes to the
//! reaper, which joins the thread and only then removes the member. That
//! ordering guarantees Disconnected is the last notification for a member
//! and that its context is dropped after the worker is gone.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::core::codec::{recv_any, FrameCodec, Received};
use crate::core::Data;
use crate::error::{ErrorCategory, Result};
use crate::registry::member::{MemberId, MemberState, MemberTable};
use crate::registry::session::Session;
use crate::registry::{Handler, Registry, Shared};
use crate::utils::Metrics;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside an engine callback.
pub(crate) fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// Marks the current thread as running code under the registry lock.
pub(crate) struct CallbackScope {
    outer: bool,
}

impl CallbackScope {
    pub(crate) fn enter() -> Self {
        Self {
            outer: IN_CALLBACK.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(self.outer));
    }
}

/// Source of inbound values for one member.
pub(crate) trait Inbound: Send {
    /// Block until the next value arrives or the input ends.
    fn receive(&mut self, metrics: &Metrics) -> Result<Received>;
}

struct Counting<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Frames read straight off a TCP stream.
pub(crate) struct StreamInbound {
    reader: Counting<TcpStream>,
    max_payload: usize,
}

impl StreamInbound {
    pub(crate) fn new(stream: TcpStream, max_payload: usize) -> Self {
        Self {
            reader: Counting {
                inner: stream,
                count: 0,
            },
            max_payload,
        }
    }
}

impl Inbound for StreamInbound {
    fn receive(&mut self, metrics: &Metrics) -> Result<Received> {
        self.reader.count = 0;
        let received = recv_any(&mut self.reader, self.max_payload)?;
        if matches!(received, Received::Frame(_)) {
            metrics.frame_received(self.reader.count);
        }
        Ok(received)
    }
}

/// Frames decoded from datagrams routed to this peer's inbox.
pub(crate) struct DatagramInbound {
    inbox: Receiver<Bytes>,
    codec: FrameCodec,
    pending: VecDeque<Data>,
}

impl DatagramInbound {
    pub(crate) fn new(inbox: Receiver<Bytes>, codec: FrameCodec) -> Self {
        Self {
            inbox,
            codec,
            pending: VecDeque::new(),
        }
    }
}

impl Inbound for DatagramInbound {
    fn receive(&mut self, metrics: &Metrics) -> Result<Received> {
        loop {
            if let Some(data) = self.pending.pop_front() {
                return Ok(Received::Frame(data));
            }
            let Ok(datagram) = self.inbox.recv() else {
                return Ok(Received::Closed);
            };
            let frames = self.codec.decode_datagram(&datagram)?;
            metrics.datagram_received(frames.len() as u64, datagram.len() as u64);
            self.pending.extend(frames);
        }
    }
}

pub(crate) enum ReaperMsg {
    Exited(MemberId),
    Drain,
}

/// Tells the reaper a worker is done, however its loop ended.
struct ExitNotice {
    reaper: Sender<ReaperMsg>,
    id: MemberId,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if self.reaper.send(ReaperMsg::Exited(self.id)).is_err() {
            warn!(member = %self.id, "Reaper gone before worker exit");
        }
    }
}

/// Body of a member worker thread.
pub(crate) fn run_member(shared: Arc<Shared>, id: MemberId, mut inbound: Box<dyn Inbound>) {
    let _notice = ExitNotice {
        reaper: shared.reaper.clone(),
        id,
    };

    shared.deliver(id, Data::Connected);

    while shared.is_running() {
        match inbound.receive(&shared.metrics) {
            Ok(Received::Frame(data)) => {
                trace!(member = %id, tag = ?data.tag(), "Frame received");
                shared.deliver(id, data);
            }
            Ok(Received::Closed) => {
                debug!(member = %id, "Input closed");
                break;
            }
            Err(e) if e.is_disconnect() => {
                debug!(member = %id, error = %e, "Connection dropped");
                break;
            }
            Err(e) => {
                if e.category() == ErrorCategory::Protocol {
                    shared.metrics.protocol_error();
                } else {
                    shared.metrics.connection_error();
                }
                warn!(member = %id, error = %e, "Receive failed, closing member");
                shared.last_error.record(format!("member {id}: {e}"));
                break;
            }
        }
    }
}

/// Body of the reaper thread. Exits after `Drain` once the table is empty.
pub(crate) fn run_reaper(shared: Arc<Shared>, exits: Receiver<ReaperMsg>) {
    let mut draining = false;
    loop {
        if draining && shared.member_count() == 0 {
            break;
        }
        match exits.recv() {
            Ok(ReaperMsg::Exited(id)) => shared.retire(id),
            Ok(ReaperMsg::Drain) => draining = true,
            Err(_) => break,
        }
    }
    debug!("Reaper stopped");
}

impl Shared {
    /// Run the handler for one value under the registry lock.
    pub(crate) fn deliver(&self, id: MemberId, data: Data) {
        let mut registry = self.lock_registry();
        let Registry { members, handler } = &mut *registry;
        if matches!(data, Data::Connected) {
            if let Some(member) = members.get_mut(id) {
                if member.state == MemberState::Created {
                    member.state = MemberState::Active;
                }
            }
        }
        self.invoke(members, handler, id, data);
    }

    fn invoke(&self, members: &mut MemberTable, handler: &mut Handler, id: MemberId, data: Data) {
        let mut session = Session::new(members, self);
        let _scope = CallbackScope::enter();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut session, id, data)));
        if outcome.is_err() {
            error!(member = %id, "Callback panicked");
            self.last_error
                .record(format!("callback panicked while handling member {id}"));
        }
    }

    /// Join a finished worker, remove its member, then notify Disconnected.
    fn retire(&self, id: MemberId) {
        let worker = {
            let mut registry = self.lock_registry();
            match registry.members.get_mut(id) {
                Some(member) => {
                    member.request_close();
                    member.worker.take()
                }
                None => return,
            }
        };

        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!(member = %id, "Worker thread panicked");
            }
        }

        let mut registry = self.lock_registry();
        let Registry { members, handler } = &mut *registry;
        let Some(member) = members.remove(id) else {
            return;
        };
        let remote = member.remote;
        drop(member);
        self.forget_link(id);
        self.metrics.member_removed();
        info!(member = %id, %remote, remaining = members.len(), "Member removed");

        self.invoke(members, handler, id, Data::Disconnected);
    }
}
