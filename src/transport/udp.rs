//! UDP socket setup and datagram I/O for the peer mesh.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, instrument, trace};

use crate::error::{NetworkError, Result};

/// Create and bind the shared peer socket.
///
/// `poll_interval` becomes the read timeout so the receiver can notice
/// shutdown without a datagram arriving.
#[instrument(level = "debug")]
pub fn bind(addr: SocketAddr, poll_interval: Duration) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(NetworkError::Socket)?;

    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| NetworkError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    socket
        .set_read_timeout(Some(poll_interval))
        .map_err(NetworkError::Socket)?;

    Ok(socket.into())
}

/// Send one datagram, refusing anything larger than `max_datagram`.
pub fn send(socket: &UdpSocket, to: SocketAddr, bytes: &[u8], max_datagram: usize) -> Result<usize> {
    if bytes.len() > max_datagram {
        return Err(NetworkError::OversizedFrame(bytes.len()));
    }
    let sent = socket
        .send_to(bytes, to)
        .map_err(|e| NetworkError::Send(format!("{to}: {e}")))?;
    trace!(to = %to, bytes = sent, "Datagram sent");
    Ok(sent)
}

/// Wait up to the socket's read timeout for one datagram.
///
/// `Ok(None)` means the timeout elapsed, or the OS reported an ICMP
/// "port unreachable" for an earlier send, which is not a receive failure.
pub fn recv(socket: &UdpSocket, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
    match socket.recv_from(buf) {
        Ok((n, from)) => Ok(Some((n, from))),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(None)
        }
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            debug!(error = %e, "Ignoring ICMP unreachable on peer socket");
            Ok(None)
        }
        Err(e) => Err(NetworkError::Receive(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv_roundtrip() {
        let a = bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(200)).unwrap();
        let b = bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(200)).unwrap();
        let b_addr = b.local_addr().unwrap();

        send(&a, b_addr, b"hello", 1024).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = recv(&b, &mut buf).unwrap().expect("datagram");
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_recv_times_out_quietly() {
        let sock = bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(20)).unwrap();
        let mut buf = [0u8; 16];
        assert!(recv(&sock, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_datagram_refused() {
        let sock = bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(20)).unwrap();
        let target = sock.local_addr().unwrap();
        assert!(matches!(
            send(&sock, target, &[0u8; 32], 16),
            Err(NetworkError::OversizedFrame(32))
        ));
    }
}
