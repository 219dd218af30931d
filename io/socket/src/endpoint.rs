//! Host/port pair prior to address resolution.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// An address to listen on or connect to.
///
/// The host may be a DNS name or a literal IPv4/IPv6 address; resolution
/// happens when a socket is created. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to zero or more socket addresses.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs = (self.host.as_str(), self.port).to_socket_addrs()?;
        Ok(addrs.collect())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}
