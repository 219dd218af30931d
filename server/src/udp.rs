//! UDP datagram server.

use crate::events::UdpEvents;
use io_socket::Endpoint;
use parking_lot::Mutex;
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const RECV_BUF_SIZE: usize = 4096;

// read timeout so the receive loop observes the running flag
const POLL_TICK: Duration = Duration::from_millis(500);

struct Inner {
    endpoint: Endpoint,
    socket: Mutex<Option<Arc<Socket>>>,
    events: Arc<dyn UdpEvents>,
    running: AtomicBool,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Datagram server with a single receive loop.
///
/// Cheap to clone; clones share the same server.
#[derive(Clone)]
pub struct UdpServer {
    inner: Arc<Inner>,
}

impl UdpServer {
    pub fn new(endpoint: Endpoint, events: Arc<dyn UdpEvents>) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                socket: Mutex::new(None),
                events,
                running: AtomicBool::new(false),
                recv_thread: Mutex::new(None),
            }),
        }
    }

    /// Bind and spawn the receive loop. A no-op when already running.
    pub fn start(&self) -> io::Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let socket = match io_socket::bind_udp(&inner.endpoint) {
            Ok(socket) => socket,
            Err(e) => {
                inner.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let _ = io_socket::set_read_timeout(&socket, Some(POLL_TICK));
        *inner.socket.lock() = Some(Arc::new(socket));

        let loop_inner = Arc::clone(inner);
        let handle = std::thread::Builder::new()
            .name("udp-recv".to_string())
            .spawn(move || recv_loop(&loop_inner))?;
        *inner.recv_thread.lock() = Some(handle);
        tracing::info!(endpoint = %inner.endpoint, "udp server listening");
        Ok(())
    }

    /// Flip the running flag and join the receive loop.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = inner.recv_thread.lock().take() {
            let _ = handle.join();
        }
        *inner.socket.lock() = None;
        tracing::info!(endpoint = %inner.endpoint, "udp server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The bound address, useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.inner.socket.lock();
        socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// Send one datagram to `dst`.
    pub fn send(&self, data: &[u8], dst: &Endpoint) -> io::Result<usize> {
        let socket = self
            .inner
            .socket
            .lock()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server is not running"))?;
        io_socket::send_to(&*socket, data, dst)
    }
}

fn recv_loop(inner: &Arc<Inner>) {
    let Some(socket) = inner.socket.lock().clone() else {
        return;
    };
    let fd = socket.as_raw_fd();
    let mut buf = [0u8; RECV_BUF_SIZE];
    let server = UdpServer {
        inner: Arc::clone(inner),
    };
    while inner.running.load(Ordering::Acquire) {
        match io_socket::recv_from(&*socket, &mut buf) {
            Ok((n, peer)) => inner.events.on_receive(&server, fd, peer, &buf[..n]),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::error!("udp recv failed: {e}");
                inner.running.store(false, Ordering::Release);
                break;
            }
        }
    }
}
