//! The registry view handed to callbacks.
//!
//! A [`Session`] borrows the member table while the registry lock is held, so
//! everything done through it is atomic with respect to other callbacks and
//! to the facade. Calling [`Engine`](crate::Engine) methods from inside a
//! callback fails with [`NetworkError::Reentrant`]; use the session instead.

use std::any::Any;
use std::net::SocketAddr;

use tracing::debug;

use crate::core::Data;
use crate::engine::Mode;
use crate::error::constants::ERR_NO_CONTEXT;
use crate::error::{NetworkError, Result};
use crate::registry::member::{MemberId, MemberState, MemberTable};
use crate::registry::Shared;

pub struct Session<'a> {
    members: &'a mut MemberTable,
    shared: &'a Shared,
}

impl<'a> Session<'a> {
    pub(crate) fn new(members: &'a mut MemberTable, shared: &'a Shared) -> Self {
        Self { members, shared }
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Maximum number of members the engine was started with.
    pub fn capacity(&self) -> usize {
        self.members.capacity()
    }

    /// Registered members in table order.
    pub fn members(&self) -> Vec<MemberId> {
        self.members.ids()
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members.get(id).is_some()
    }

    pub fn state(&self, id: MemberId) -> Option<MemberState> {
        self.members.get(id).map(|m| m.state)
    }

    pub fn remote_addr(&self, id: MemberId) -> Option<SocketAddr> {
        self.members.get(id).map(|m| m.remote)
    }

    /// Send one value to one member.
    pub fn send(&self, id: MemberId, data: &Data) -> Result<()> {
        let result = match self.members.get(id) {
            Some(member) => self.shared.transmit(id, &member.outbound, data),
            None => Err(NetworkError::UnknownMember(id.get())),
        };
        self.shared.track(result)
    }

    /// Send to every member. Returns how many sends succeeded.
    pub fn send_to_all(&self, data: &Data) -> Result<usize> {
        let targets = self.members.targets(None);
        self.shared.fan_out(targets, data)
    }

    /// Send to every member except `exclude`.
    pub fn broadcast(&self, data: &Data, exclude: MemberId) -> Result<usize> {
        let targets = self.members.targets(Some(exclude));
        self.shared.fan_out(targets, data)
    }

    /// Attach `value` to a member, dropping any earlier context.
    pub fn set_context<T: Any + Send>(&mut self, id: MemberId, value: T) -> Result<()> {
        let result = match self.members.get_mut(id) {
            Some(member) => {
                if member.context.set(value) {
                    debug!(member = %id, "Context replaced");
                }
                Ok(())
            }
            None => Err(NetworkError::UnknownMember(id.get())),
        };
        self.shared.track(result)
    }

    /// Borrow a member's context.
    ///
    /// `None` when the member is unknown, has nothing attached, or holds a
    /// different type; the reason is written to the last-error slot.
    pub fn context<T: Any>(&self, id: MemberId) -> Option<&T> {
        let shared = self.shared;
        let lookup = match self.members.get(id) {
            Some(member) => member.context.get::<T>(),
            None => Err(NetworkError::UnknownMember(id.get())),
        };
        settle(shared, id, lookup)
    }

    pub fn context_mut<T: Any>(&mut self, id: MemberId) -> Option<&mut T> {
        let shared = self.shared;
        let lookup = match self.members.get_mut(id) {
            Some(member) => member.context.get_mut::<T>(),
            None => Err(NetworkError::UnknownMember(id.get())),
        };
        settle(shared, id, lookup)
    }

    /// Detach a member's context and hand ownership to the caller.
    pub fn take_context<T: Any>(&mut self, id: MemberId) -> Option<T> {
        let shared = self.shared;
        let lookup = match self.members.get_mut(id) {
            Some(member) => member.context.take::<T>(),
            None => Err(NetworkError::UnknownMember(id.get())),
        };
        settle(shared, id, lookup)
    }

    /// Drop a member's context. Returns whether anything was attached.
    pub fn clear_context(&mut self, id: MemberId) -> bool {
        self.members
            .get_mut(id)
            .map(|member| member.context.clear())
            .unwrap_or(false)
    }

    /// Ask a member's worker to stop.
    ///
    /// The member stays registered until the worker has exited; its
    /// Disconnected notification follows from the reaper.
    pub fn disconnect(&mut self, id: MemberId) -> Result<()> {
        let result = match self.members.get_mut(id) {
            Some(member) => {
                debug!(member = %id, "Disconnect requested");
                member.request_close();
                Ok(())
            }
            None => Err(NetworkError::UnknownMember(id.get())),
        };
        self.shared.track(result)
    }

    /// Write an application message into the engine's last-error slot.
    pub fn record_error(&self, message: impl Into<String>) {
        self.shared.last_error.record(message);
    }
}

fn settle<T>(shared: &Shared, id: MemberId, lookup: Result<Option<T>>) -> Option<T> {
    match lookup {
        Ok(Some(value)) => Some(value),
        Ok(None) => {
            shared
                .last_error
                .record(format!("member {id}: {ERR_NO_CONTEXT}"));
            None
        }
        Err(e) => {
            shared.last_error.record(format!("member {id}: {e}"));
            None
        }
    }
}
