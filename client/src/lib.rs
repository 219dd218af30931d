//! TCP client with a dedicated receive loop and automatic reconnection.
//!
//! [`TcpClient`] connects, runs a receive thread that feeds every read
//! to the owner's callback object, and reconnects with a jittered
//! backoff when the transport drops. TLS is optional; the handshake
//! completes inside `start`/reconnect before the receive loop resumes.

mod reconnect;

pub use reconnect::ReconnectPolicy;

use io_socket::Endpoint;
use io_tls::{HandshakeStatus, TlsConnector, TlsSession};
use parking_lot::Mutex;
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const RECV_BUF_SIZE: usize = 4096;

// read timeout so the receive loop observes the stop flag
const POLL_TICK: Duration = Duration::from_millis(500);

/// Callbacks a [`TcpClient`] invokes from its receive thread.
///
/// All methods default to no-ops. Do not call [`TcpClient::stop`] from
/// inside a callback; it joins the thread the callback runs on.
pub trait ClientEvents: Send + Sync {
    /// The transport connected (initially or after a reconnect).
    fn on_connect(&self, client: &TcpClient, peer: SocketAddr) {
        let _ = (client, peer);
    }

    /// One receive's worth of bytes arrived.
    fn on_receive(&self, client: &TcpClient, peer: SocketAddr, data: &[u8]) {
        let _ = (client, peer, data);
    }

    /// The transport dropped (peer EOF, error, or an explicit stop).
    fn on_disconnect(&self, client: &TcpClient, peer: SocketAddr) {
        let _ = (client, peer);
    }
}

struct Inner {
    endpoint: Endpoint,
    events: Arc<dyn ClientEvents>,
    tls: Option<TlsConnector>,
    socket: Mutex<Option<Arc<Socket>>>,
    session: Mutex<Option<TlsSession>>,
    peer: Mutex<Option<SocketAddr>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    policy: Mutex<ReconnectPolicy>,
    // only one reconnect chain at a time
    reconnect_gate: Mutex<()>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

/// TCP client with optional TLS.
///
/// Cheap to clone; clones share the same client.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<Inner>,
}

impl TcpClient {
    pub fn new(endpoint: Endpoint, events: Arc<dyn ClientEvents>) -> Self {
        Self::build(endpoint, events, None)
    }

    /// A client that wraps its transport in TLS. The endpoint host is
    /// used as the name the server certificate must prove.
    pub fn with_tls(
        endpoint: Endpoint,
        events: Arc<dyn ClientEvents>,
        connector: TlsConnector,
    ) -> Self {
        Self::build(endpoint, events, Some(connector))
    }

    fn build(
        endpoint: Endpoint,
        events: Arc<dyn ClientEvents>,
        tls: Option<TlsConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                events,
                tls,
                socket: Mutex::new(None),
                session: Mutex::new(None),
                peer: Mutex::new(None),
                connected: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                policy: Mutex::new(ReconnectPolicy::default()),
                reconnect_gate: Mutex::new(()),
                recv_thread: Mutex::new(None),
            }),
        }
    }

    /// Replace the reconnection policy.
    pub fn set_reconnect(&self, policy: ReconnectPolicy) {
        *self.inner.policy.lock() = policy;
    }

    /// Connect (including the TLS handshake when configured) and spawn
    /// the receive thread.
    pub fn start(&self) -> io::Result<()> {
        let inner = &self.inner;
        if inner.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        inner.stopped.store(false, Ordering::Release);
        inner.connect()?;

        let mut guard = inner.recv_thread.lock();
        if guard.is_none() {
            let loop_inner = Arc::clone(inner);
            *guard = Some(
                std::thread::Builder::new()
                    .name("client-recv".to_string())
                    .spawn(move || recv_loop(&loop_inner))?,
            );
        }
        Ok(())
    }

    /// Disconnect (the disconnect callback fires) and join the receive
    /// thread.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::Release);
        inner.close();
        if let Some(handle) = inner.recv_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer.lock()
    }

    /// Send the whole of `data`, blocking until transferred. A
    /// transport failure closes the connection (the disconnect callback
    /// fires), kicks off reconnection, and surfaces as the error.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::Acquire) {
            return Err(not_connected());
        }
        let socket = inner.socket.lock().clone().ok_or_else(not_connected)?;
        let result = if inner.tls.is_some() {
            let mut session = inner.session.lock();
            match session.as_mut() {
                Some(session) => tls_send_all(session, &socket, data),
                None => Err(not_connected()),
            }
        } else {
            io_socket::send_all(&*socket, data).map(|()| data.len())
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) => {
                inner.close();
                inner.reconnect();
                Err(e)
            }
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "client is not connected")
}

fn tls_send_all(session: &mut TlsSession, socket: &Socket, data: &[u8]) -> io::Result<usize> {
    let mut sent = 0;
    while sent < data.len() {
        sent += session.send(socket, &data[sent..])?;
        session.flush_blocking(socket)?;
    }
    Ok(sent)
}

impl Inner {
    fn client_handle(self: &Arc<Self>) -> TcpClient {
        TcpClient {
            inner: Arc::clone(self),
        }
    }

    fn connect(self: &Arc<Self>) -> io::Result<()> {
        let socket = io_socket::connect_tcp(&self.endpoint)?;
        io_socket::set_read_timeout(&socket, Some(POLL_TICK))?;
        let peer = socket
            .peer_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .ok_or_else(not_connected)?;

        if let Some(connector) = &self.tls {
            let mut session = connector
                .session(self.endpoint.host())
                .map_err(io::Error::other)?;
            loop {
                if self.stopped.load(Ordering::Acquire) {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "client stopped during handshake",
                    ));
                }
                match session.handshake(&socket)? {
                    HandshakeStatus::Complete => break,
                    // blocking socket with a read timeout: keep driving
                    HandshakeStatus::InProgress => continue,
                }
            }
            *self.session.lock() = Some(session);
        }

        *self.socket.lock() = Some(Arc::new(socket));
        *self.peer.lock() = Some(peer);
        self.connected.store(true, Ordering::Release);
        tracing::info!(%peer, "client connected");
        self.events.on_connect(&self.client_handle(), peer);
        Ok(())
    }

    fn close(self: &Arc<Self>) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let peer = self.peer.lock().take();
        {
            let socket = self.socket.lock();
            if let Some(socket) = socket.as_ref() {
                if let Some(session) = self.session.lock().as_mut() {
                    let _ = session.shutdown(&**socket);
                }
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
        }
        *self.session.lock() = None;
        *self.socket.lock() = None;
        if let Some(peer) = peer {
            tracing::info!(%peer, "client disconnected");
            self.events.on_disconnect(&self.client_handle(), peer);
        }
    }

    /// Try to re-establish the transport, sleeping a jittered interval
    /// between attempts. `true` when connected again; `false` when
    /// reconnection is disabled, already in progress elsewhere, stopped,
    /// or every allowed attempt has failed.
    fn reconnect(self: &Arc<Self>) -> bool {
        let policy = self.policy.lock().clone();
        if self.connected.load(Ordering::Acquire) {
            return true;
        }
        if !policy.enabled {
            return false;
        }
        let Some(_guard) = self.reconnect_gate.try_lock() else {
            return false;
        };
        for attempt in 1..=policy.max_attempts {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            match self.connect() {
                Ok(()) => return true,
                Err(e) => {
                    tracing::debug!(attempt, "reconnect attempt failed: {e}");
                    std::thread::sleep(policy.jittered_delay());
                }
            }
        }
        false
    }

    fn reconnect_in_progress(&self) -> bool {
        self.reconnect_gate.try_lock().is_none()
    }
}

fn recv_loop(inner: &Arc<Inner>) {
    let client = inner.client_handle();
    let mut buf = [0u8; RECV_BUF_SIZE];
    while !inner.stopped.load(Ordering::Acquire) {
        if !inner.connected.load(Ordering::Acquire) {
            if inner.reconnect() || inner.connected.load(Ordering::Acquire) {
                continue;
            }
            if inner.reconnect_in_progress() {
                // a send() thread holds the gate; give it a moment
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            // reconnection stopped, exhausted, or disabled
            break;
        }

        let Some(socket) = inner.socket.lock().clone() else {
            continue;
        };
        let Some(peer) = *inner.peer.lock() else {
            continue;
        };

        let result = if inner.tls.is_some() {
            let mut session = inner.session.lock();
            match session.as_mut() {
                Some(session) => session.recv(&*socket, &mut buf),
                None => Err(not_connected()),
            }
        } else {
            io_socket::recv(&*socket, &mut buf)
        };

        match result {
            Ok(0) => {
                inner.close();
            }
            Ok(n) => inner.events.on_receive(&client, peer, &buf[..n]),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::debug!("recv failed: {e}");
                inner.close();
            }
        }
    }
}
