//! # Engine Facade
//!
//! The public entry point: one [`Engine`] value per socket engine, owned by
//! the caller. An engine is created for a fixed [`Mode`] and can be started,
//! shut down and started again; member ids keep increasing across runs.
//!
//! ## Modes
//! - **TCP server**: [`Engine::start_server`] accepts up to N clients
//! - **TCP client**: [`Engine::connect_to_server`] holds one connection
//! - **UDP peer**: [`Engine::start_peer`] binds a socket, peers are added with
//!   [`Engine::connect_to_peer`]
//!
//! ## Callbacks
//! Every member event (Connected, each received value, Disconnected) is
//! delivered to the handler given at start, one at a time engine-wide. The
//! handler receives a [`Session`] for work that must happen atomically with
//! the event; the facade itself refuses calls made from inside a handler.
//!
//! ## Example
//! ```rust,no_run
//! use nex_network::{ConnectionType, Data, Engine, Role};
//!
//! let server = Engine::init(ConnectionType::Tcp, Role::Server)?;
//! server.start_server(9000, 16, |session, member, data| {
//!     if let Data::Text(text) = &data {
//!         let _ = session.send(member, &Data::from(text.as_str()));
//!     }
//! })?;
//!
//! // ...
//! server.shutdown()?;
//! # Ok::<(), nex_network::NetworkError>(())
//! ```

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{error, info};

use crate::config::EngineConfig;
use crate::core::Data;
use crate::error::constants::{
    ERR_ALREADY_RUNNING, ERR_INVALID_PAIRING, ERR_NOT_RUNNING, ERR_WRONG_MODE, ERR_ZERO_CAPACITY,
};
use crate::error::{NetworkError, Result};
use crate::registry::{self, in_callback, MemberId, MemberState, Resources, Runtime, Session, Shared};
use crate::transport;
use crate::utils::{LastError, Metrics, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
    Peer,
}

/// A valid connection type and role pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    TcpServer,
    TcpClient,
    UdpPeer,
}

impl Mode {
    pub fn from_pair(connection: ConnectionType, role: Role) -> Result<Self> {
        match (connection, role) {
            (ConnectionType::Tcp, Role::Server) => Ok(Mode::TcpServer),
            (ConnectionType::Tcp, Role::Client) => Ok(Mode::TcpClient),
            (ConnectionType::Udp, Role::Peer) => Ok(Mode::UdpPeer),
            _ => Err(NetworkError::InvalidArgument(ERR_INVALID_PAIRING.to_string())),
        }
    }

    pub fn connection_type(self) -> ConnectionType {
        match self {
            Mode::TcpServer | Mode::TcpClient => ConnectionType::Tcp,
            Mode::UdpPeer => ConnectionType::Udp,
        }
    }

    pub fn role(self) -> Role {
        match self {
            Mode::TcpServer => Role::Server,
            Mode::TcpClient => Role::Client,
            Mode::UdpPeer => Role::Peer,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::TcpServer => "tcp-server",
            Mode::TcpClient => "tcp-client",
            Mode::UdpPeer => "udp-peer",
        };
        f.write_str(name)
    }
}

pub struct Engine {
    resources: Resources,
    runtime: Mutex<Option<Runtime>>,
    /// Bound address of the live run; never held while a run stops.
    bound: Mutex<Option<SocketAddr>>,
}

impl Engine {
    /// Create an idle engine with default configuration.
    pub fn init(connection: ConnectionType, role: Role) -> Result<Self> {
        Self::with_config(connection, role, EngineConfig::default())
    }

    pub fn with_config(connection: ConnectionType, role: Role, config: EngineConfig) -> Result<Self> {
        let mode = Mode::from_pair(connection, role)?;
        config.validate_strict()?;

        info!(%mode, "Engine initialized");
        Ok(Self {
            resources: Resources {
                mode,
                config,
                metrics: Arc::new(Metrics::new()),
                last_error: Arc::new(LastError::new()),
                ids: Arc::new(AtomicU64::new(0)),
            },
            runtime: Mutex::new(None),
            bound: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> Mode {
        self.resources.mode
    }

    pub fn config(&self) -> &EngineConfig {
        &self.resources.config
    }

    // ---- lifecycle ----

    /// Listen on `port` and accept up to `max_clients` clients.
    ///
    /// Clients beyond capacity are accepted and closed immediately; the
    /// rejection is written to the last-error slot.
    pub fn start_server<F>(&self, port: u16, max_clients: usize, on_client_data: F) -> Result<()>
    where
        F: FnMut(&mut Session<'_>, MemberId, Data) + Send + 'static,
    {
        let result = self.launch(Mode::TcpServer, max_clients, |resources| {
            registry::serve(resources, port, max_clients, Box::new(on_client_data))
        });
        self.track(result)
    }

    /// Connect to a server. The server is the engine's only member.
    pub fn connect_to_server<F>(&self, host: &str, port: u16, on_server_data: F) -> Result<()>
    where
        F: FnMut(&mut Session<'_>, MemberId, Data) + Send + 'static,
    {
        let result = self.launch(Mode::TcpClient, 1, |resources| {
            registry::connect(resources, host, port, Box::new(on_server_data))
        });
        self.track(result)
    }

    /// Bind the peer socket on `port`, allowing up to `max_peers` peers.
    pub fn start_peer<F>(&self, port: u16, max_peers: usize, on_peer_data: F) -> Result<()>
    where
        F: FnMut(&mut Session<'_>, MemberId, Data) + Send + 'static,
    {
        let result = self.launch(Mode::UdpPeer, max_peers, |resources| {
            registry::mesh(resources, port, max_peers, Box::new(on_peer_data))
        });
        self.track(result)
    }

    /// Register a remote peer and start its worker.
    ///
    /// The returned id is never issued again by this engine.
    pub fn connect_to_peer(&self, host: &str, port: u16) -> Result<MemberId> {
        self.with_shared(Some(Mode::UdpPeer), |shared| {
            let remote = transport::resolve(host, port)?;
            shared.add_peer(remote)
        })
    }

    /// Stop all threads and remove every member, waiting for each worker to
    /// exit. Calling it on an idle engine is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if in_callback() {
            return self.track(Err(NetworkError::Reentrant));
        }
        let mut slot = self.lock_runtime();
        if let Some(mut runtime) = slot.take() {
            *self.lock_bound() = None;
            runtime.stop();
        }
        Ok(())
    }

    /// Safe to call from anywhere, callbacks included.
    pub fn is_running(&self) -> bool {
        self.lock_bound().is_some()
    }

    /// Address the listener or peer socket is bound to, or the client's local
    /// address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.lock_bound()
    }

    // ---- sending ----

    pub fn send_to_client(&self, client: MemberId, data: &Data) -> Result<()> {
        self.send_to_member(Mode::TcpServer, client, data)
    }

    /// Send to every client. Returns how many sends succeeded.
    pub fn send_to_all_clients(&self, data: &Data) -> Result<usize> {
        self.with_shared(Some(Mode::TcpServer), |shared| {
            shared.fan_out(shared.targets(None), data)
        })
    }

    /// Send to every client except `exclude`.
    pub fn broadcast_to_clients(&self, data: &Data, exclude: MemberId) -> Result<usize> {
        self.with_shared(Some(Mode::TcpServer), |shared| {
            shared.fan_out(shared.targets(Some(exclude)), data)
        })
    }

    pub fn send_to_server(&self, data: &Data) -> Result<()> {
        self.with_shared(Some(Mode::TcpClient), |shared| {
            let (id, outbound) = shared
                .targets(None)
                .into_iter()
                .next()
                .ok_or(NetworkError::ConnectionClosed)?;
            shared.transmit(id, &outbound, data)
        })
    }

    pub fn send_to_peer(&self, peer: MemberId, data: &Data) -> Result<()> {
        self.send_to_member(Mode::UdpPeer, peer, data)
    }

    fn send_to_member(&self, mode: Mode, id: MemberId, data: &Data) -> Result<()> {
        self.with_shared(Some(mode), |shared| {
            let outbound = shared.outbound(id)?;
            shared.transmit(id, &outbound, data)
        })
    }

    // ---- context ----

    /// Attach `value` to a client, dropping any earlier context.
    pub fn set_client_context<T: Any + Send>(&self, client: MemberId, value: T) -> Result<()> {
        self.set_context(Mode::TcpServer, client, value)
    }

    /// Copy of a client's context.
    ///
    /// `None` if the client is unknown or has no context of type `T`; the
    /// reason is written to the last-error slot.
    pub fn client_context<T: Any + Clone>(&self, client: MemberId) -> Option<T> {
        self.context_with(Mode::TcpServer, client, |value: &mut T| value.clone())
    }

    /// Run `f` on a client's context under the registry lock.
    pub fn with_client_context<T: Any, R>(&self, client: MemberId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.context_with(Mode::TcpServer, client, f)
    }

    pub fn take_client_context<T: Any>(&self, client: MemberId) -> Option<T> {
        self.take_context(Mode::TcpServer, client)
    }

    pub fn set_peer_context<T: Any + Send>(&self, peer: MemberId, value: T) -> Result<()> {
        self.set_context(Mode::UdpPeer, peer, value)
    }

    pub fn peer_context<T: Any + Clone>(&self, peer: MemberId) -> Option<T> {
        self.context_with(Mode::UdpPeer, peer, |value: &mut T| value.clone())
    }

    pub fn with_peer_context<T: Any, R>(&self, peer: MemberId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.context_with(Mode::UdpPeer, peer, f)
    }

    pub fn take_peer_context<T: Any>(&self, peer: MemberId) -> Option<T> {
        self.take_context(Mode::UdpPeer, peer)
    }

    fn set_context<T: Any + Send>(&self, mode: Mode, id: MemberId, value: T) -> Result<()> {
        self.with_shared(Some(mode), |shared| {
            shared.with_session(|session| session.set_context(id, value))
        })
    }

    fn context_with<T: Any, R>(&self, mode: Mode, id: MemberId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.with_shared(Some(mode), |shared| {
            Ok(shared.with_session(|session| session.context_mut::<T>(id).map(f)))
        })
        .ok()
        .flatten()
    }

    fn take_context<T: Any>(&self, mode: Mode, id: MemberId) -> Option<T> {
        self.with_shared(Some(mode), |shared| {
            Ok(shared.with_session(|session| session.take_context::<T>(id)))
        })
        .ok()
        .flatten()
    }

    // ---- members ----

    /// Ask one member's worker to stop. Its Disconnected event follows once
    /// the worker has exited.
    pub fn disconnect(&self, member: MemberId) -> Result<()> {
        self.with_shared(None, |shared| shared.disconnect(member))
    }

    /// Number of registered members. Safe to call from anywhere, callbacks
    /// included.
    pub fn member_count(&self) -> usize {
        self.resources.metrics.members_active.load(Ordering::Relaxed) as usize
    }

    /// Registered member ids in registry order.
    pub fn members(&self) -> Result<Vec<MemberId>> {
        self.with_shared(None, |shared| Ok(shared.member_ids()))
    }

    pub fn member_state(&self, member: MemberId) -> Option<MemberState> {
        self.with_shared(None, |shared| Ok(shared.member_state(member)))
            .ok()
            .flatten()
    }

    // ---- errors and metrics ----

    pub fn last_error(&self) -> Option<String> {
        self.resources.last_error.get()
    }

    /// Write the last error, or "No error occurred.", to stderr.
    pub fn print_last_error(&self) {
        eprintln!("{}", self.resources.last_error.describe());
    }

    pub fn clear_last_error(&self) {
        self.resources.last_error.clear();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.resources.metrics.snapshot()
    }

    // ---- internals ----

    fn lock_runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_bound(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.resources.last_error.record(e.to_string());
        }
        result
    }

    fn check(&self, mode: Option<Mode>) -> Result<()> {
        if in_callback() {
            return Err(NetworkError::Reentrant);
        }
        match mode {
            Some(mode) if mode != self.resources.mode => Err(NetworkError::InvalidState(ERR_WRONG_MODE)),
            _ => Ok(()),
        }
    }

    fn launch<F>(&self, mode: Mode, capacity: usize, start: F) -> Result<()>
    where
        F: FnOnce(&Resources) -> Result<Runtime>,
    {
        self.check(Some(mode))?;
        if capacity == 0 {
            return Err(NetworkError::InvalidArgument(ERR_ZERO_CAPACITY.to_string()));
        }
        let mut slot = self.lock_runtime();
        if slot.is_some() {
            return Err(NetworkError::InvalidState(ERR_ALREADY_RUNNING));
        }
        let runtime = start(&self.resources)?;
        *self.lock_bound() = Some(runtime.local_addr());
        *slot = Some(runtime);
        Ok(())
    }

    /// Run `op` against the live run, outside the lifecycle lock.
    fn with_shared<T>(&self, mode: Option<Mode>, op: impl FnOnce(&Arc<Shared>) -> Result<T>) -> Result<T> {
        let result = self.check(mode).and_then(|()| {
            let shared = self
                .lock_runtime()
                .as_ref()
                .map(|runtime| Arc::clone(runtime.shared()))
                .ok_or(NetworkError::InvalidState(ERR_NOT_RUNNING))?;
            op(&shared)
        });
        self.track(result)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.resources.mode)
            .field("running", &self.is_running())
            .field("members", &self.member_count())
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let slot = self.runtime.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(mut runtime) = slot.take() else {
            return;
        };
        if !in_callback() {
            runtime.stop();
            return;
        }

        // Dropped from inside a callback: this thread holds the registry lock
        // and may be a worker or the reaper, so stop from a fresh thread once
        // the callback has returned.
        let spawned = thread::Builder::new()
            .name("nex-stop".to_string())
            .spawn(move || runtime.stop());
        if let Err(e) = spawned {
            error!(error = %e, "Could not spawn shutdown thread; engine threads left running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairings() {
        assert_eq!(Mode::from_pair(ConnectionType::Tcp, Role::Server).unwrap(), Mode::TcpServer);
        assert_eq!(Mode::from_pair(ConnectionType::Tcp, Role::Client).unwrap(), Mode::TcpClient);
        assert_eq!(Mode::from_pair(ConnectionType::Udp, Role::Peer).unwrap(), Mode::UdpPeer);

        for (connection, role) in [
            (ConnectionType::Tcp, Role::Peer),
            (ConnectionType::Udp, Role::Server),
            (ConnectionType::Udp, Role::Client),
        ] {
            assert!(matches!(
                Engine::init(connection, role),
                Err(NetworkError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_mode_roundtrip() {
        for mode in [Mode::TcpServer, Mode::TcpClient, Mode::UdpPeer] {
            assert_eq!(Mode::from_pair(mode.connection_type(), mode.role()).unwrap(), mode);
        }
        assert_eq!(Mode::UdpPeer.to_string(), "udp-peer");
    }

    #[test]
    fn test_idle_engine_rejects_operations() {
        let engine = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
        assert!(!engine.is_running());
        assert!(engine.local_addr().is_none());

        let err = engine.send_to_all_clients(&Data::Int(1)).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidState(ERR_NOT_RUNNING)));
        assert_eq!(engine.last_error().as_deref(), Some(err.to_string().as_str()));

        assert!(engine.shutdown().is_ok());
        assert!(engine.shutdown().is_ok());
    }

    #[test]
    fn test_wrong_mode_and_zero_capacity() {
        let engine = Engine::init(ConnectionType::Tcp, Role::Server).unwrap();
        assert!(matches!(
            engine.send_to_server(&Data::Int(1)),
            Err(NetworkError::InvalidState(ERR_WRONG_MODE))
        ));
        assert!(matches!(
            engine.start_peer(0, 4, |_, _, _| {}),
            Err(NetworkError::InvalidState(ERR_WRONG_MODE))
        ));
        assert!(matches!(
            engine.start_server(0, 0, |_, _, _| {}),
            Err(NetworkError::InvalidArgument(_))
        ));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::default_with_overrides(|c| c.peer.inbox_capacity = 0);
        assert!(Engine::with_config(ConnectionType::Udp, Role::Peer, config).is_err());
    }

    #[test]
    fn test_last_error_lifecycle() {
        let engine = Engine::init(ConnectionType::Udp, Role::Peer).unwrap();
        assert!(engine.last_error().is_none());
        assert!(engine.connect_to_peer("127.0.0.1", 9).is_err());
        assert!(engine.last_error().is_some());
        engine.print_last_error();
        engine.clear_last_error();
        assert!(engine.last_error().is_none());
    }
}
