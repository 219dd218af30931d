//! Callback contracts for server owners.

use crate::{TcpServer, UdpServer};
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Callbacks a [`TcpServer`] invokes from its worker threads.
///
/// Fixed at construction so there is no window between installing a
/// handler and the event loop running. Implementations must tolerate
/// concurrent invocation for different descriptors; events for one
/// descriptor never overlap (one-shot rearm serializes them). All
/// methods default to no-ops.
///
/// Do not call [`TcpServer::stop`] from inside a callback; it joins the
/// worker pool the callback runs on.
pub trait ServerEvents: Send + Sync {
    /// A connection was accepted and registered.
    fn on_connect(&self, server: &TcpServer, fd: RawFd, peer: SocketAddr) {
        let _ = (server, fd, peer);
    }

    /// One receive's worth of bytes arrived; `data` is exactly what the
    /// read returned.
    fn on_receive(&self, server: &TcpServer, fd: RawFd, peer: SocketAddr, data: &[u8]) {
        let _ = (server, fd, peer, data);
    }

    /// The connection closed (peer EOF, transport error, or an explicit
    /// close). Fires exactly once per connection.
    fn on_disconnect(&self, server: &TcpServer, peer: SocketAddr) {
        let _ = (server, peer);
    }
}

/// Callback a [`UdpServer`] invokes from its receive thread.
pub trait UdpEvents: Send + Sync {
    /// One datagram arrived from `peer`.
    fn on_receive(&self, server: &UdpServer, fd: RawFd, peer: SocketAddr, data: &[u8]) {
        let _ = (server, fd, peer, data);
    }
}
