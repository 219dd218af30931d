//! Socket lifecycle and signal-safe I/O primitives.
//!
//! Every I/O call here retries transparently on `EINTR`; would-block
//! surfaces as [`std::io::ErrorKind::WouldBlock`], and sends carry
//! `MSG_NOSIGNAL` so a broken pipe is reported as an error instead of a
//! signal. Server sockets come back with `SO_REUSEADDR` set and, for
//! IPv6, dual-stack enabled.

mod endpoint;
mod socket;

pub use endpoint::Endpoint;
pub use socket::{
    accept, bind_udp, close_conn, connect_tcp, listen_tcp, recv, recv_from, send, send_all,
    send_to, sendfile, set_keepalive, set_nodelay, set_nonblocking, set_read_timeout,
    set_recv_buffer_size, set_reuse_port, set_send_buffer_size, set_write_timeout, wait_writable,
};
