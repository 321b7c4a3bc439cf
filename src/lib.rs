//! # nex-network
//!
//! Embeddable socket engine with three connection models over plain OS
//! sockets:
//!
//! - a multi-client TCP server,
//! - a single-connection TCP client,
//! - a UDP peer mesh sharing one bound socket.
//!
//! Values travel as tagged, length-prefixed frames (see [`crate::core::codec`]).
//! Each member gets its own worker thread, and application callbacks run one
//! at a time under the registry lock, so handlers need no synchronization of
//! their own.
//!
//! ```rust,no_run
//! use nex_network::{ConnectionType, Data, Engine, Role};
//!
//! let client = Engine::init(ConnectionType::Tcp, Role::Client)?;
//! client.connect_to_server("127.0.0.1", 9000, |_session, _server, data| {
//!     println!("server says {data:?}");
//! })?;
//! client.send_to_server(&Data::from("hello, socket!"))?;
//! # Ok::<(), nex_network::NetworkError>(())
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod registry;
pub mod transport;
pub mod utils;

pub use crate::config::EngineConfig;
pub use crate::core::{Data, FrameCodec, Tag};
pub use crate::engine::{ConnectionType, Engine, Mode, Role};
pub use crate::error::{ErrorCategory, ErrorCode, NetworkError, Result};
pub use crate::registry::{Handler, MemberId, MemberState, Session};
pub use crate::utils::MetricsSnapshot;
