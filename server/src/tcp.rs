//! Event-driven TCP server.
//!
//! One dedicated thread blocks in the readiness notifier and turns
//! events into executor tasks: the listener's readiness becomes an
//! accept batch, a connection's readiness becomes a receive task, and an
//! error event becomes a close. Every descriptor is registered
//! edge-triggered and one-shot, so at most one receive task works a
//! given connection at a time; the task re-arms the descriptor when the
//! socket is drained.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::events::ServerEvents;
use ahash::RandomState;
use executor::Executor;
use io_poller::{Interest, Poller};
use io_socket::Endpoint;
use io_tls::{HandshakeStatus, TlsAcceptor, TlsSession};
use parking_lot::Mutex;
use socket2::Socket;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::JoinHandle;

/// Receive buffer used by every recv task.
const RECV_BUF_SIZE: usize = 4096;

struct TlsConn {
    session: TlsSession,
    // set once the handshake completes; recv tasks drive it until then
    ready: bool,
}

struct ConnRecord {
    socket: Socket,
    peer: SocketAddr,
    tls: Option<Mutex<TlsConn>>,
}

struct Inner {
    endpoint: Endpoint,
    max_connections: usize,
    listener: Mutex<Option<Socket>>,
    listener_fd: AtomicI32,
    poller: Poller,
    pool: Executor,
    conns: Mutex<HashMap<RawFd, Arc<ConnRecord>, RandomState>>,
    events: Arc<dyn ServerEvents>,
    tls: Option<TlsAcceptor>,
    running: AtomicBool,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Event-driven TCP server with optional TLS.
///
/// Cheap to clone; clones share the same server. Call
/// [`stop`](TcpServer::stop) before dropping the last handle, and never
/// from inside a callback.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<Inner>,
}

impl TcpServer {
    /// Build a server from configuration and a callback object. TLS
    /// material is loaded here; listening starts with
    /// [`start`](TcpServer::start).
    pub fn new(config: &ServerConfig, events: Arc<dyn ServerEvents>) -> Result<Self, ServerError> {
        let tls = config.tls.as_ref().map(|t| t.acceptor()).transpose()?;
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint: config.endpoint(),
                max_connections: config.max_connections,
                listener: Mutex::new(None),
                listener_fd: AtomicI32::new(-1),
                poller: Poller::new()?,
                pool: Executor::new(config.workers.executor_config()),
                conns: Mutex::new(HashMap::default()),
                events,
                tls,
                running: AtomicBool::new(false),
                event_thread: Mutex::new(None),
            }),
        })
    }

    /// Bind, register the listener, and spawn the event loop. A no-op
    /// when already running; a failed start leaves the server stopped.
    pub fn start(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.start_inner() {
            inner.running.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn start_inner(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        let listener = io_socket::listen_tcp(&inner.endpoint)?;
        io_socket::set_nonblocking(&listener, true)?;

        inner.poller.restart()?;
        inner.pool.start();

        let fd = listener.as_raw_fd();
        inner.poller.add(fd, Interest::read_oneshot())?;
        inner.listener_fd.store(fd, Ordering::Release);
        *inner.listener.lock() = Some(listener);

        let loop_inner = Arc::clone(inner);
        let handle = std::thread::Builder::new()
            .name("server-listener".to_string())
            .spawn(move || event_loop(&loop_inner))
            .map_err(io::Error::from)?;
        *inner.event_thread.lock() = Some(handle);

        tracing::info!(endpoint = %inner.endpoint, "tcp server listening");
        Ok(())
    }

    /// Stop the event loop, close every connection (disconnect
    /// callbacks fire), stop the worker pool, and release the listener.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        inner.poller.stop();
        if let Some(handle) = inner.event_thread.lock().take() {
            let _ = handle.join();
        }

        let drained: Vec<(RawFd, Arc<ConnRecord>)> = inner.conns.lock().drain().collect();
        for (_, record) in drained {
            if let Some(tls) = &record.tls {
                let _ = tls.lock().session.shutdown(&record.socket);
            }
            let _ = io_socket::close_conn(&record.socket, None);
            inner.events.on_disconnect(self, record.peer);
        }

        inner.pool.stop();
        inner.listener_fd.store(-1, Ordering::Release);
        *inner.listener.lock() = None;
        tracing::info!(endpoint = %inner.endpoint, "tcp server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The bound listener address, useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let listener = self.inner.listener.lock();
        listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().len()
    }

    /// Send the whole of `data` to `fd`, retrying until every byte is
    /// transferred. A transport failure closes the connection (the
    /// disconnect callback fires) and surfaces as the error.
    pub fn send(&self, fd: RawFd, data: &[u8]) -> io::Result<usize> {
        let record = self.inner.conn(fd).ok_or_else(unknown_fd)?;
        let result = match &record.tls {
            Some(tls) => tls_send_all(&mut tls.lock(), &record.socket, data),
            None => io_socket::send_all(&record.socket, data).map(|()| data.len()),
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) => {
                self.inner.close_conn(fd);
                Err(e)
            }
        }
    }

    /// Transfer `count` bytes of `src` to the connection via
    /// kernel-space copy. Unavailable on TLS servers.
    pub fn sendfile<S: AsFd>(
        &self,
        fd: RawFd,
        src: &S,
        offset: Option<&mut libc::off_t>,
        count: usize,
    ) -> io::Result<usize> {
        let record = self.inner.conn(fd).ok_or_else(unknown_fd)?;
        if record.tls.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "sendfile bypasses the tls session",
            ));
        }
        match io_socket::sendfile(&record.socket, src, offset, count) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.inner.close_conn(fd);
                Err(e)
            }
        }
    }

    /// Best-effort send to every connection; per-descriptor failures do
    /// not abort the iteration.
    pub fn send_to_all(&self, data: &[u8]) {
        let fds: Vec<RawFd> = self.inner.conns.lock().keys().copied().collect();
        for fd in fds {
            if let Err(e) = self.send(fd, data) {
                tracing::debug!(fd, "broadcast send failed: {e}");
            }
        }
    }

    /// Close one connection; the disconnect callback fires if it was
    /// still tracked.
    pub fn close(&self, fd: RawFd) {
        self.inner.close_conn(fd);
    }
}

fn unknown_fd() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "descriptor is not a tracked connection")
}

fn tls_send_all(tls: &mut TlsConn, socket: &Socket, data: &[u8]) -> io::Result<usize> {
    if !tls.ready {
        return Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "tls handshake not complete",
        ));
    }
    let mut sent = 0;
    while sent < data.len() {
        sent += tls.session.send(socket, &data[sent..])?;
        tls.session.flush_blocking(socket)?;
    }
    Ok(sent)
}

impl Inner {
    fn conn(&self, fd: RawFd) -> Option<Arc<ConnRecord>> {
        self.conns.lock().get(&fd).cloned()
    }

    fn server_handle(self: &Arc<Self>) -> TcpServer {
        TcpServer {
            inner: Arc::clone(self),
        }
    }

    /// Remove `fd` from the map and tear the connection down. Map
    /// removal is the linearization point: whichever caller wins fires
    /// the disconnect callback exactly once.
    fn close_conn(self: &Arc<Self>, fd: RawFd) {
        let record = { self.conns.lock().remove(&fd) };
        let Some(record) = record else { return };
        let _ = self.poller.remove(fd);
        if let Some(tls) = &record.tls {
            let _ = tls.lock().session.shutdown(&record.socket);
        }
        let _ = io_socket::close_conn(&record.socket, None);
        self.events.on_disconnect(&self.server_handle(), record.peer);
    }

    /// Accept until the backlog drains, then re-arm the listener.
    fn accept_batch(self: &Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let accepted = {
                let listener = self.listener.lock();
                let Some(listener) = listener.as_ref() else {
                    return;
                };
                io_socket::accept(listener)
            };
            match accepted {
                Ok(Some((socket, peer))) => self.admit(socket, peer),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    break;
                }
            }
        }
        let listener_fd = self.listener_fd.load(Ordering::Acquire);
        if listener_fd >= 0 {
            let _ = self.poller.modify(listener_fd, Interest::read_oneshot());
        }
    }

    fn admit(self: &Arc<Self>, socket: Socket, peer: SocketAddr) {
        // over the cap: close silently, no callback fires
        if self.conns.lock().len() >= self.max_connections {
            tracing::warn!(%peer, "connection cap reached, rejecting");
            return;
        }
        if let Err(e) = io_socket::set_nonblocking(&socket, true) {
            tracing::warn!(%peer, "failed to set non-blocking: {e}");
            return;
        }
        let tls = match &self.tls {
            Some(acceptor) => match acceptor.session() {
                Ok(session) => Some(Mutex::new(TlsConn {
                    session,
                    ready: false,
                })),
                Err(e) => {
                    tracing::warn!(%peer, "failed to create tls session: {e}");
                    return;
                }
            },
            None => None,
        };

        let fd = socket.as_raw_fd();
        let record = Arc::new(ConnRecord { socket, peer, tls });
        self.conns.lock().insert(fd, record);
        if let Err(e) = self.poller.add(fd, Interest::read_oneshot()) {
            tracing::warn!(%peer, "failed to register connection: {e}");
            self.conns.lock().remove(&fd);
            return;
        }
        tracing::debug!(fd, %peer, "connection accepted");
        self.events.on_connect(&self.server_handle(), fd, peer);
    }

    /// Drain one connection's kernel buffer. Edge-triggered readiness
    /// will not re-fire for data already queued, so the loop reads until
    /// a short read, EOF, or error, then re-arms the descriptor.
    fn recv_task(self: &Arc<Self>, fd: RawFd) {
        let Some(record) = self.conn(fd) else { return };

        if let Some(tls) = &record.tls {
            let ready = tls.lock().ready;
            // on completion fall through and drain: application data can
            // arrive in the same flight as the handshake finish
            if !ready && !self.drive_handshake(fd, &record) {
                return;
            }
        }

        let mut buf = [0u8; RECV_BUF_SIZE];
        while self.running.load(Ordering::Acquire) {
            let result = match &record.tls {
                Some(tls) => tls.lock().session.recv(&record.socket, &mut buf),
                None => io_socket::recv(&record.socket, &mut buf),
            };
            match result {
                Ok(0) => {
                    self.close_conn(fd);
                    return;
                }
                Ok(n) => {
                    self.events
                        .on_receive(&self.server_handle(), fd, record.peer, &buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(fd, "recv failed: {e}");
                    self.close_conn(fd);
                    return;
                }
            }
        }
        let _ = self.poller.modify(fd, Interest::read_oneshot());
    }

    /// Advance the handshake one step. `true` means it completed and
    /// the caller should drain the session; otherwise the descriptor
    /// has been re-armed (or closed on a fatal alert).
    fn drive_handshake(self: &Arc<Self>, fd: RawFd, record: &Arc<ConnRecord>) -> bool {
        let Some(tls) = &record.tls else {
            return false;
        };
        let status = tls.lock().session.handshake(&record.socket);
        match status {
            Ok(HandshakeStatus::Complete) => {
                tls.lock().ready = true;
                tracing::debug!(fd, "tls handshake complete");
                true
            }
            Ok(HandshakeStatus::InProgress) => {
                let _ = self.poller.modify(fd, Interest::read_oneshot());
                false
            }
            Err(e) => {
                tracing::debug!(fd, "tls handshake failed: {e}");
                self.close_conn(fd);
                false
            }
        }
    }
}

/// Dedicated readiness loop: block in the notifier, dispatch each event
/// as a pool task.
fn event_loop(inner: &Arc<Inner>) {
    let listener_fd = inner.listener_fd.load(Ordering::Acquire);
    while inner.running.load(Ordering::Acquire) {
        let events = match inner.poller.wait() {
            Ok(events) => events,
            // the poller only fails once stopped
            Err(_) => break,
        };
        for event in events {
            let fd = event.fd();
            if fd == listener_fd {
                let task_inner = Arc::clone(inner);
                drop(inner.pool.submit_normal(move || task_inner.accept_batch()));
            } else if event.is_error() {
                let task_inner = Arc::clone(inner);
                drop(inner.pool.submit_normal(move || task_inner.close_conn(fd)));
            } else {
                let task_inner = Arc::clone(inner);
                drop(inner.pool.submit_normal(move || task_inner.recv_task(fd)));
            }
        }
    }
}
