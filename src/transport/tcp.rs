//! TCP listener and stream setup.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, instrument, warn};

use crate::error::{NetworkError, Result};

/// Create, bind and listen, reporting the failing stage.
///
/// The listener is returned in non-blocking mode so the accept loop can poll
/// its running flag between attempts.
#[instrument(level = "debug")]
pub fn listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(NetworkError::Socket)?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!(error = %e, "SO_REUSEADDR not applied");
    }

    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| NetworkError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    socket.listen(backlog).map_err(NetworkError::Listen)?;
    socket.set_nonblocking(true).map_err(NetworkError::Listen)?;

    let listener: TcpListener = socket.into();
    debug!(local = ?listener.local_addr().ok(), "Listener ready");
    Ok(listener)
}

/// Connect to `addr`, optionally bounded by `timeout`.
#[instrument(level = "debug")]
pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream> {
    let attempt = match timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
        None => TcpStream::connect(addr),
    };
    attempt.map_err(|source| NetworkError::Connect {
        addr: addr.to_string(),
        source,
    })
}

/// Put an accepted or connected stream into the mode workers expect.
///
/// `write_timeout` bounds each blocking write so a peer that stops reading
/// cannot stall its sender indefinitely.
pub fn prepare(stream: &TcpStream, nodelay: bool, write_timeout: Option<Duration>) -> Result<()> {
    stream.set_nonblocking(false).map_err(NetworkError::Socket)?;
    stream
        .set_write_timeout(write_timeout)
        .map_err(NetworkError::Socket)?;
    if let Err(e) = stream.set_nodelay(nodelay) {
        warn!(error = %e, "TCP_NODELAY not applied");
    }
    Ok(())
}

/// Three handles onto one connection.
///
/// The reader belongs to the worker, the writer is shared by every sender,
/// and the control handle is used to shut the socket down from outside.
pub struct StreamParts {
    pub reader: TcpStream,
    pub writer: TcpStream,
    pub control: TcpStream,
    pub peer_addr: SocketAddr,
}

pub fn split(stream: TcpStream) -> Result<StreamParts> {
    let peer_addr = stream.peer_addr().map_err(NetworkError::Socket)?;
    let reader = stream.try_clone().map_err(NetworkError::Socket)?;
    let control = stream.try_clone().map_err(NetworkError::Socket)?;
    Ok(StreamParts {
        reader,
        writer: stream,
        control,
        peer_addr,
    })
}

/// Shut both directions down, unblocking any reader. Errors are ignored since
/// the peer may already be gone.
pub fn close(control: &TcpStream) {
    if let Err(e) = control.shutdown(Shutdown::Both) {
        debug!(error = %e, "Shutdown on closed stream");
    }
}
