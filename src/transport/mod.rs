//! # Transport Primitives
//!
//! Thin wrappers over OS sockets.
//!
//! Setup is split into its stages (create, bind, listen) so each failure maps
//! onto its own [`NetworkError`] variant. Everything above this module works
//! with plain `std::net` handles.

pub mod tcp;
pub mod udp;

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::{NetworkError, Result};

/// Build a socket address from an interface/host string and a port.
///
/// IP literals are parsed directly; anything else goes through the system
/// resolver and the first IPv4 result is preferred.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut candidates = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::InvalidArgument(format!("cannot resolve '{host}': {e}")))?
        .collect::<Vec<_>>();
    candidates.sort_by_key(|addr| !addr.is_ipv4());
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| NetworkError::InvalidArgument(format!("no address found for '{host}'")))
}
