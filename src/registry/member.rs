//! Member identity, per-member link state and the compacting member table.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::error::{NetworkError, Result};
use crate::registry::context::ContextSlot;
use crate::transport::tcp;

/// Identity of one registered member.
///
/// Issued from a per-engine counter that is never reset, so an id is never
/// handed out twice for the life of the engine, across restarts included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u64);

impl MemberId {
    /// Rebuild an id from [`get`](Self::get). Lookups with an id that was
    /// never issued, or whose member is gone, fail with `UnknownMember`.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a member.
///
/// `Created` → `Active` once its Connected notification has been delivered,
/// `ClosingRequested` after a local disconnect or shutdown, `Removed` right
/// before the entry is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Created,
    Active,
    ClosingRequested,
    Removed,
}

/// Where outbound frames for a member go.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Tcp(Arc<Mutex<TcpStream>>),
    Udp(SocketAddr),
}

/// Handle used to stop a member's worker from outside.
#[derive(Debug)]
pub(crate) enum Control {
    /// Also listed in the run's link list so shutdown can reach it unlocked.
    Tcp(Arc<TcpStream>),
    /// Dropping the sender ends the worker's inbox.
    Udp(Option<Sender<Bytes>>),
}

#[derive(Debug)]
pub(crate) struct Member {
    pub(crate) id: MemberId,
    pub(crate) state: MemberState,
    pub(crate) remote: SocketAddr,
    pub(crate) outbound: Outbound,
    pub(crate) control: Control,
    pub(crate) context: ContextSlot,
    pub(crate) worker: Option<JoinHandle<()>>,
}

impl Member {
    pub(crate) fn new(id: MemberId, remote: SocketAddr, outbound: Outbound, control: Control) -> Self {
        Self {
            id,
            state: MemberState::Created,
            remote,
            outbound,
            control,
            context: ContextSlot::default(),
            worker: None,
        }
    }

    /// Unblock the worker so it exits. Safe to call more than once.
    pub(crate) fn request_close(&mut self) {
        if matches!(self.state, MemberState::Created | MemberState::Active) {
            self.state = MemberState::ClosingRequested;
        }
        match &mut self.control {
            Control::Tcp(stream) => tcp::close(stream),
            Control::Udp(inbox) => {
                inbox.take();
            }
        }
    }

    /// Inbox sender for datagram routing, if the member is still open.
    pub(crate) fn inbox(&self) -> Option<&Sender<Bytes>> {
        match &self.control {
            Control::Udp(Some(tx)) => Some(tx),
            _ => None,
        }
    }
}

/// Dense, bounded table of members.
///
/// Removal shifts later entries down so live members always occupy the
/// first `len()` slots.
#[derive(Debug)]
pub(crate) struct MemberTable {
    members: Vec<Member>,
    capacity: usize,
}

impl MemberTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            members: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub(crate) fn insert(&mut self, member: Member) -> Result<&mut Member> {
        if self.is_full() {
            return Err(NetworkError::CapacityReached {
                limit: self.capacity,
            });
        }
        self.members.push(member);
        let last = self.members.len() - 1;
        Ok(&mut self.members[last])
    }

    pub(crate) fn position(&self, id: MemberId) -> Option<usize> {
        self.members.iter().position(|m| m.id == id)
    }

    pub(crate) fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: MemberId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    /// Lookup by remote address, used to route datagrams.
    pub(crate) fn find_by_remote(&self, remote: SocketAddr) -> Option<&Member> {
        self.members.iter().find(|m| m.remote == remote)
    }

    /// Remove a member, compacting the table.
    pub(crate) fn remove(&mut self, id: MemberId) -> Option<Member> {
        let index = self.position(id)?;
        let mut member = self.members.remove(index);
        member.state = MemberState::Removed;
        Some(member)
    }

    pub(crate) fn ids(&self) -> Vec<MemberId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Snapshot of send handles, optionally skipping one member.
    pub(crate) fn targets(&self, exclude: Option<MemberId>) -> Vec<(MemberId, Outbound)> {
        self.members
            .iter()
            .filter(|m| Some(m.id) != exclude)
            .map(|m| (m.id, m.outbound.clone()))
            .collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.members.iter_mut()
    }
}
