//! Listener address parsing.

use std::net::SocketAddr;

use crate::Error;

/// Resolve a `tcp://host:port` URL into a socket address. IPv6 hosts use the
/// usual bracket form, `tcp://[::1]:443`.
pub fn resolve_url(url: &str) -> Result<SocketAddr, Error> {
    let rest = url
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::InvalidAddress(url.to_string()))?;
    rest.parse()
        .map_err(|_| Error::InvalidAddress(url.to_string()))
}
