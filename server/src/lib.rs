//! Event-driven TCP and UDP servers.
//!
//! The TCP server owns its listening socket, tracks accepted
//! connections, and dispatches accept and receive work into an elastic
//! worker pool driven by a readiness notifier. Per-connection receive
//! work is serialized by one-shot rearm rather than per-descriptor
//! locks. TLS is optional and wraps connections through the `io-tls`
//! adapter. The UDP server runs a single datagram receive loop.

pub mod config;
pub mod logging;

mod error;
mod events;
mod tcp;
mod udp;

pub use config::{LogFormat, LoggingConfig, ServerConfig, TlsSettings, WorkerSettings};
pub use error::ServerError;
pub use events::{ServerEvents, UdpEvents};
pub use tcp::TcpServer;
pub use udp::UdpServer;
