//! # Error Types
//!
//! Error handling for the socket engine.
//!
//! Every fallible operation returns [`Result<T>`], carrying a [`NetworkError`]
//! from the taxonomy below. Each error also maps onto a numeric [`ErrorCode`]
//! matching the classic C-style status codes, and onto an [`ErrorCategory`].
//!
//! ## Error Categories
//! - **Initialization**: lock or platform setup, invalid configuration
//! - **Argument**: invalid mode/role, capacity of zero, unknown member ids
//! - **Capacity**: member limit reached
//! - **Transport**: socket create/bind/listen/accept/connect/send/receive failures
//! - **Protocol**: unrecognized tag, length mismatch, malformed payload
//! - **Resource**: oversized frames, allocation failure
//! - **Threading**: worker spawn failure
//!
//! ## Example Usage
//! ```rust
//! use nex_network::error::{ErrorCode, NetworkError, Result};
//!
//! fn check_capacity(limit: usize) -> Result<usize> {
//!     if limit == 0 {
//!         return Err(NetworkError::InvalidArgument("capacity must be positive".into()));
//!     }
//!     Ok(limit)
//! }
//!
//! let err = check_capacity(0).unwrap_err();
//! assert_eq!(err.code(), ErrorCode::Invalid);
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lifecycle errors
    pub const ERR_NOT_RUNNING: &str = "Engine is not running";
    pub const ERR_ALREADY_RUNNING: &str = "Engine is already running";
    pub const ERR_WRONG_MODE: &str = "Operation not available in this connection mode";
    pub const ERR_REENTRANT: &str =
        "Engine facade called from inside a callback; use the Session argument instead";

    /// Argument errors
    pub const ERR_ZERO_CAPACITY: &str = "Maximum member count must be greater than 0";
    pub const ERR_INVALID_PAIRING: &str =
        "Invalid connection type / role pairing (expected TCP+Server, TCP+Client or UDP+Peer)";

    /// Context errors
    pub const ERR_NO_CONTEXT: &str = "Member has no context attached";
    pub const ERR_CONTEXT_TYPE: &str = "Member context has a different type";

    /// Protocol errors
    pub const ERR_SYNTHETIC_TAG: &str = "Connection notifications are never transmitted";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Numeric status codes, one per failure family.
///
/// `Ok` is never produced by [`NetworkError::code`]; it exists so callers that
/// bridge to integer status codes have a complete table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Socket,
    Bind,
    Listen,
    Accept,
    Connect,
    Send,
    Recv,
    Timeout,
    Thread,
    Initialization,
    Invalid,
    Memory,
    Unknown,
}

impl ErrorCode {
    /// The integer value of this code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Taxonomy buckets for [`NetworkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Initialization,
    Argument,
    Capacity,
    Transport,
    Protocol,
    Resource,
    Threading,
}

// NetworkError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Unknown member: {0}")]
    UnknownMember(u64),

    #[error("Capacity reached: {limit} members")]
    CapacityReached { limit: usize },

    #[error("Socket creation failed: {0}")]
    Socket(io::Error),

    #[error("Socket bind failed on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("Listen failed: {0}")]
    Listen(io::Error),

    #[error("Accept failed: {0}")]
    Accept(io::Error),

    #[error("Connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unrecognized frame tag: {0}")]
    UnknownTag(u8),

    #[error("Frame length mismatch for tag {tag}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        tag: u8,
        expected: usize,
        actual: usize,
    },

    #[error("String payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Document payload error: {0}")]
    Document(String),

    #[error("Tag {0} is a local notification and cannot be transmitted")]
    NotTransmittable(u8),

    #[error("Datagram ended inside a frame ({0} trailing bytes)")]
    TruncatedDatagram(usize),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Allocation of {0} bytes failed")]
    Allocation(usize),

    #[error("Thread spawn failed: {0}")]
    Thread(io::Error),

    #[error("{}", constants::ERR_REENTRANT)]
    Reentrant,
}

impl NetworkError {
    /// Numeric status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            NetworkError::Io(_) => ErrorCode::Unknown,
            NetworkError::Initialization(_) | NetworkError::Config(_) => {
                ErrorCode::Initialization
            }
            NetworkError::InvalidArgument(_)
            | NetworkError::InvalidState(_)
            | NetworkError::UnknownMember(_)
            | NetworkError::CapacityReached { .. }
            | NetworkError::UnknownTag(_)
            | NetworkError::LengthMismatch { .. }
            | NetworkError::InvalidUtf8
            | NetworkError::Document(_)
            | NetworkError::NotTransmittable(_)
            | NetworkError::TruncatedDatagram(_)
            | NetworkError::Reentrant => ErrorCode::Invalid,
            NetworkError::Socket(_) => ErrorCode::Socket,
            NetworkError::Bind { .. } => ErrorCode::Bind,
            NetworkError::Listen(_) => ErrorCode::Listen,
            NetworkError::Accept(_) => ErrorCode::Accept,
            NetworkError::Connect { .. } => ErrorCode::Connect,
            NetworkError::Send(_) => ErrorCode::Send,
            NetworkError::Receive(_) | NetworkError::ConnectionClosed => ErrorCode::Recv,
            NetworkError::OversizedFrame(_) | NetworkError::Allocation(_) => ErrorCode::Memory,
            NetworkError::Thread(_) => ErrorCode::Thread,
        }
    }

    /// Taxonomy bucket for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetworkError::Initialization(_) | NetworkError::Config(_) => {
                ErrorCategory::Initialization
            }
            NetworkError::InvalidArgument(_)
            | NetworkError::InvalidState(_)
            | NetworkError::UnknownMember(_)
            | NetworkError::Reentrant => ErrorCategory::Argument,
            NetworkError::CapacityReached { .. } => ErrorCategory::Capacity,
            NetworkError::Io(_)
            | NetworkError::Socket(_)
            | NetworkError::Bind { .. }
            | NetworkError::Listen(_)
            | NetworkError::Accept(_)
            | NetworkError::Connect { .. }
            | NetworkError::Send(_)
            | NetworkError::Receive(_)
            | NetworkError::ConnectionClosed => ErrorCategory::Transport,
            NetworkError::UnknownTag(_)
            | NetworkError::LengthMismatch { .. }
            | NetworkError::InvalidUtf8
            | NetworkError::Document(_)
            | NetworkError::NotTransmittable(_)
            | NetworkError::TruncatedDatagram(_) => ErrorCategory::Protocol,
            NetworkError::OversizedFrame(_) | NetworkError::Allocation(_) => {
                ErrorCategory::Resource
            }
            NetworkError::Thread(_) => ErrorCategory::Threading,
        }
    }

    /// Whether the error means the remote end went away rather than failed.
    pub fn is_disconnect(&self) -> bool {
        match self {
            NetworkError::ConnectionClosed => true,
            NetworkError::Io(e) | NetworkError::Receive(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }
}

/// I/O error kinds that signal an orderly or abrupt peer close.
pub(crate) fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    )
}

/// Type alias for Results using NetworkError
pub type Result<T> = std::result::Result<T, NetworkError>;
