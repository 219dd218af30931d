//! Per-connection TLS session.

use bytes::{Buf, BytesMut};
use io_socket::wait_writable;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;

/// Result of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The handshake finished; the session is ready for data.
    Complete,
    /// The socket was not ready; retry on the next readiness event.
    InProgress,
}

#[derive(Debug)]
enum SessionKind {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

impl SessionKind {
    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(conn) => conn.is_handshaking(),
            Self::Server(conn) => conn.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(conn) => conn.wants_write(),
            Self::Server(conn) => conn.wants_write(),
        }
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.read_tls(rd),
            Self::Server(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.write_tls(wr),
            Self::Server(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Client(conn) => conn.process_new_packets(),
            Self::Server(conn) => conn.process_new_packets(),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.reader().read(buf),
            Self::Server(conn) => conn.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.writer().write(buf),
            Self::Server(conn) => conn.writer().write(buf),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Client(conn) => conn.send_close_notify(),
            Self::Server(conn) => conn.send_close_notify(),
        }
    }

    fn complete_io(&mut self, io: &mut (impl Read + Write)) -> io::Result<(usize, usize)> {
        match self {
            Self::Client(conn) => conn.complete_io(io),
            Self::Server(conn) => conn.complete_io(io),
        }
    }
}

/// One TLS session bound to one connection.
///
/// The session never owns the descriptor: every operation borrows it,
/// and callers must keep the fd open until [`shutdown`](Self::shutdown)
/// has run.
#[derive(Debug)]
pub struct TlsSession {
    conn: SessionKind,
    // decrypted bytes not yet handed to the caller
    plaintext: BytesMut,
}

// Read/Write shim over a borrowed socket; io-socket already handles
// EINTR and MSG_NOSIGNAL.
struct SockIo<'a, S: AsFd>(&'a S);

impl<S: AsFd> Read for SockIo<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io_socket::recv(self.0, buf)
    }
}

impl<S: AsFd> Write for SockIo<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io_socket::send(self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsSession {
    pub(crate) fn client(conn: rustls::ClientConnection) -> Self {
        Self::new(SessionKind::Client(conn))
    }

    pub(crate) fn server(conn: rustls::ServerConnection) -> Self {
        Self::new(SessionKind::Server(conn))
    }

    fn new(conn: SessionKind) -> Self {
        Self {
            conn,
            plaintext: BytesMut::with_capacity(16384),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Drive the handshake as far as the socket allows.
    ///
    /// `InProgress` means the peer's next flight has not arrived yet
    /// (`WANT_READ`/`WANT_WRITE`); fatal alerts surface as errors.
    pub fn handshake<S: AsFd>(&mut self, sock: &S) -> io::Result<HandshakeStatus> {
        let mut io = SockIo(sock);
        while self.conn.is_handshaking() {
            match self.conn.complete_io(&mut io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStatus::InProgress);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(HandshakeStatus::Complete)
    }

    /// Read decrypted data into `buf`. `Ok(0)` is an orderly close
    /// (close_notify or EOF); would-block means the socket is drained.
    pub fn recv<S: AsFd>(&mut self, sock: &S, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.plaintext.is_empty() {
                let n = buf.len().min(self.plaintext.len());
                buf[..n].copy_from_slice(&self.plaintext[..n]);
                self.plaintext.advance(n);
                return Ok(n);
            }

            // stage whatever is already decrypted; the final handshake
            // flight can carry application data that never produces
            // another readiness event
            let mut chunk = [0u8; 16384];
            match self.conn.read_plaintext(&mut chunk) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    self.plaintext.extend_from_slice(&chunk[..n]);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.conn.read_tls(&mut SockIo(sock))? == 0 {
                return Ok(0);
            }
            if let Err(e) = self.conn.process_new_packets() {
                // flush any queued alert before reporting
                let _ = self.conn.write_tls(&mut SockIo(sock));
                return Err(io::Error::other(e));
            }
            self.flush_writes(sock)?;
        }
    }

    /// Encrypt `buf` and push as much ciphertext as the socket accepts.
    /// Unsent ciphertext stays queued and is flushed by later calls.
    pub fn send<S: AsFd>(&mut self, sock: &S, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.write_plaintext(buf)?;
        self.flush_writes(sock)?;
        Ok(n)
    }

    /// Flush queued ciphertext, waiting out would-block until the kernel
    /// has taken all of it.
    pub fn flush_blocking<S: AsFd>(&mut self, sock: &S) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SockIo(sock)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(sock)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Initiate a bidirectional shutdown: queue close_notify and flush
    /// it. The caller closes the descriptor only after this returns.
    pub fn shutdown<S: AsFd>(&mut self, sock: &S) -> io::Result<()> {
        self.conn.send_close_notify();
        self.flush_writes(sock)
    }

    fn flush_writes<S: AsFd>(&mut self, sock: &S) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SockIo(sock)) {
                Ok(_) => {}
                // ciphertext stays queued for the next flush
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
