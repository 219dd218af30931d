//! Socket creation and signal-safe I/O.

use crate::Endpoint;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

fn new_socket(addr: &SocketAddr, ty: Type) -> io::Result<Socket> {
    let protocol = if ty == Type::STREAM {
        Protocol::TCP
    } else {
        Protocol::UDP
    };
    Socket::new(Domain::for_address(*addr), ty, Some(protocol))
}

fn no_usable_address(last: Option<io::Error>) -> io::Error {
    last.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "endpoint resolved to no usable address",
        )
    })
}

// recv wants an uninitialized buffer; callers hand us plain byte slices.
fn uninit_mut(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the same layout as u8 and recv only
    // ever writes into the slice.
    unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) }
}

/// Create a listening TCP socket for `endpoint`.
///
/// Sets `SO_REUSEADDR`, clears `IPV6_V6ONLY` on v6 addresses, binds, and
/// listens with the platform maximum backlog. Tries each resolved
/// address in order and returns the first that binds.
pub fn listen_tcp(endpoint: &Endpoint) -> io::Result<Socket> {
    let mut last = None;
    for addr in endpoint.resolve()? {
        let attempt = (|| {
            let socket = new_socket(&addr, Type::STREAM)?;
            socket.set_reuse_address(true)?;
            if addr.is_ipv6() {
                socket.set_only_v6(false)?;
            }
            socket.bind(&addr.into())?;
            socket.listen(libc::SOMAXCONN)?;
            Ok(socket)
        })();
        match attempt {
            Ok(socket) => return Ok(socket),
            Err(e) => last = Some(e),
        }
    }
    Err(no_usable_address(last))
}

/// Connect a blocking TCP socket to `endpoint`, trying each resolved
/// address in order.
pub fn connect_tcp(endpoint: &Endpoint) -> io::Result<Socket> {
    let mut last = None;
    for addr in endpoint.resolve()? {
        let attempt = (|| {
            let socket = new_socket(&addr, Type::STREAM)?;
            socket.connect(&addr.into())?;
            Ok(socket)
        })();
        match attempt {
            Ok(socket) => return Ok(socket),
            Err(e) => last = Some(e),
        }
    }
    Err(no_usable_address(last))
}

/// Bind a UDP socket to `endpoint`.
pub fn bind_udp(endpoint: &Endpoint) -> io::Result<Socket> {
    let mut last = None;
    for addr in endpoint.resolve()? {
        let attempt = (|| {
            let socket = new_socket(&addr, Type::DGRAM)?;
            socket.set_reuse_address(true)?;
            if addr.is_ipv6() {
                socket.set_only_v6(false)?;
            }
            socket.bind(&addr.into())?;
            Ok(socket)
        })();
        match attempt {
            Ok(socket) => return Ok(socket),
            Err(e) => last = Some(e),
        }
    }
    Err(no_usable_address(last))
}

/// Accept one connection. `None` means the listener has drained its
/// backlog (would-block on a non-blocking listener).
pub fn accept(listener: &Socket) -> io::Result<Option<(Socket, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((socket, addr)) => {
                let addr = addr.as_socket().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "accepted non-inet peer")
                })?;
                return Ok(Some((socket, addr)));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Receive into `buf`. `Ok(0)` is orderly EOF; would-block passes
/// through as an error of kind `WouldBlock`.
pub fn recv<S: AsFd>(sock: &S, buf: &mut [u8]) -> io::Result<usize> {
    let sock = SockRef::from(sock);
    loop {
        match sock.recv(uninit_mut(buf)) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Receive one datagram and its source address.
pub fn recv_from<S: AsFd>(sock: &S, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let sock = SockRef::from(sock);
    loop {
        match sock.recv_from(uninit_mut(buf)) {
            Ok((n, addr)) => {
                let addr = addr.as_socket().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "datagram from non-inet source")
                })?;
                return Ok((n, addr));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Send as much of `buf` as the kernel accepts. `MSG_NOSIGNAL` keeps a
/// broken pipe from raising SIGPIPE.
pub fn send<S: AsFd>(sock: &S, buf: &[u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let sock = SockRef::from(sock);
    loop {
        match sock.send_with_flags(buf, libc::MSG_NOSIGNAL) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Send the whole of `buf`, waiting out would-block on non-blocking
/// descriptors until every byte is transferred.
pub fn send_all<S: AsFd>(sock: &S, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match send(sock, &buf[sent..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ));
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(sock)?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Send one datagram to `endpoint` (first resolved address).
pub fn send_to<S: AsFd>(sock: &S, buf: &[u8], endpoint: &Endpoint) -> io::Result<usize> {
    let addr = endpoint
        .resolve()?
        .into_iter()
        .next()
        .ok_or_else(|| no_usable_address(None))?;
    let sock = SockRef::from(sock);
    loop {
        match sock.send_to_with_flags(buf, &addr.into(), libc::MSG_NOSIGNAL) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Block until the descriptor is writable.
pub fn wait_writable<S: AsFd>(sock: &S) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd: sock.as_fd().as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Copy `count` bytes from `src` to the socket `dst`, looping until the
/// full count is transferred. Retries interruption and waits out
/// would-block; stops early only if `src` hits EOF.
pub fn sendfile<D: AsFd, S: AsFd>(
    dst: &D,
    src: &S,
    mut offset: Option<&mut libc::off_t>,
    count: usize,
) -> io::Result<usize> {
    let dst_fd = dst.as_fd().as_raw_fd();
    let src_fd = src.as_fd().as_raw_fd();
    let mut sent = 0;
    while sent < count {
        let off_ptr: *mut libc::off_t = match offset.as_mut() {
            Some(o) => std::ptr::from_mut(&mut **o),
            None => std::ptr::null_mut(),
        };
        let rc = unsafe { libc::sendfile(dst_fd, src_fd, off_ptr, count - sent) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    wait_writable(dst)?;
                    continue;
                }
                _ => return Err(err),
            }
        }
        if rc == 0 {
            break;
        }
        sent += rc as usize;
    }
    Ok(sent)
}

/// Toggle non-blocking mode.
pub fn set_nonblocking<S: AsFd>(sock: &S, nonblocking: bool) -> io::Result<()> {
    SockRef::from(sock).set_nonblocking(nonblocking)
}

/// Orderly connection shutdown: close the write half, optionally drain
/// data the peer already sent, then close the read half. The descriptor
/// itself is released when its owner drops it. Returns the number of
/// bytes drained.
pub fn close_conn<S: AsFd>(sock: &S, drain: Option<&mut [u8]>) -> io::Result<usize> {
    let sref = SockRef::from(sock);
    let _ = sref.shutdown(Shutdown::Write);
    let mut drained = 0;
    if let Some(buf) = drain {
        // one read captures whatever the peer already sent; looping
        // could block a blocking descriptor indefinitely
        if let Ok(n) = recv(sock, buf) {
            drained = n;
        }
    }
    let _ = sref.shutdown(Shutdown::Read);
    Ok(drained)
}

/// Configure TCP keepalive probing: seconds idle before the first probe,
/// seconds between probes, and probes before the peer is declared dead.
pub fn set_keepalive<S: AsFd>(
    sock: &S,
    enable: bool,
    idle: Duration,
    interval: Duration,
    retries: u32,
) -> io::Result<()> {
    let sock = SockRef::from(sock);
    if !enable {
        return sock.set_keepalive(false);
    }
    let params = TcpKeepalive::new()
        .with_time(idle)
        .with_interval(interval)
        .with_retries(retries);
    sock.set_tcp_keepalive(&params)
}

/// Disable Nagle's algorithm.
pub fn set_nodelay<S: AsFd>(sock: &S, nodelay: bool) -> io::Result<()> {
    SockRef::from(sock).set_nodelay(nodelay)
}

/// Allow multiple sockets to bind the same address/port pair.
pub fn set_reuse_port<S: AsFd>(sock: &S, reuse: bool) -> io::Result<()> {
    SockRef::from(sock).set_reuse_port(reuse)
}

/// Resize the kernel receive buffer.
pub fn set_recv_buffer_size<S: AsFd>(sock: &S, size: usize) -> io::Result<()> {
    SockRef::from(sock).set_recv_buffer_size(size)
}

/// Resize the kernel send buffer.
pub fn set_send_buffer_size<S: AsFd>(sock: &S, size: usize) -> io::Result<()> {
    SockRef::from(sock).set_send_buffer_size(size)
}

pub fn set_read_timeout<S: AsFd>(sock: &S, timeout: Option<Duration>) -> io::Result<()> {
    SockRef::from(sock).set_read_timeout(timeout)
}

pub fn set_write_timeout<S: AsFd>(sock: &S, timeout: Option<Duration>) -> io::Result<()> {
    SockRef::from(sock).set_write_timeout(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loopback_listener() -> (Socket, Endpoint) {
        let listener = listen_tcp(&Endpoint::new("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        (listener, Endpoint::from(addr))
    }

    #[test]
    fn listen_connect_roundtrip() {
        let (listener, endpoint) = loopback_listener();
        let client = connect_tcp(&endpoint).unwrap();
        let (server_side, peer) = accept(&listener).unwrap().unwrap();
        assert_eq!(
            peer.port(),
            client.local_addr().unwrap().as_socket().unwrap().port()
        );

        send_all(&client, b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = recv(&server_side, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        send_all(&server_side, b"pong").unwrap();
        let n = recv(&client, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn accept_would_block_when_backlog_empty() {
        let (listener, _) = loopback_listener();
        listener.set_nonblocking(true).unwrap();
        assert!(accept(&listener).unwrap().is_none());
    }

    #[test]
    fn recv_reports_eof() {
        let (listener, endpoint) = loopback_listener();
        let client = connect_tcp(&endpoint).unwrap();
        let (server_side, _) = accept(&listener).unwrap().unwrap();
        drop(client);
        let mut buf = [0u8; 16];
        assert_eq!(recv(&server_side, &mut buf).unwrap(), 0);
    }

    #[test]
    fn send_all_drains_large_buffer_nonblocking() {
        let (listener, endpoint) = loopback_listener();
        let client = connect_tcp(&endpoint).unwrap();
        let (server_side, _) = accept(&listener).unwrap().unwrap();
        set_nonblocking(&client, true).unwrap();

        let payload = vec![0xabu8; 1 << 20];
        let reader = std::thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            loop {
                match recv(&server_side, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => panic!("reader failed: {e}"),
                }
            }
            total
        });

        send_all(&client, &payload).unwrap();
        drop(client);
        assert_eq!(reader.join().unwrap(), payload.len());
    }

    #[test]
    fn close_conn_shuts_both_halves() {
        let (listener, endpoint) = loopback_listener();
        let client = connect_tcp(&endpoint).unwrap();
        let (server_side, _) = accept(&listener).unwrap().unwrap();

        send_all(&client, b"tail").unwrap();
        let mut drain = [0u8; 64];
        let drained = close_conn(&server_side, Some(&mut drain)).unwrap();
        assert_eq!(drained, 4);

        // the peer observes EOF
        let mut buf = [0u8; 8];
        assert_eq!(recv(&client, &mut buf).unwrap(), 0);
    }

    #[test]
    fn udp_send_to_recv_from() {
        let server = bind_udp(&Endpoint::new("127.0.0.1", 0)).unwrap();
        let server_ep = Endpoint::from(server.local_addr().unwrap().as_socket().unwrap());
        let client = bind_udp(&Endpoint::new("127.0.0.1", 0)).unwrap();

        assert_eq!(send_to(&client, b"datagram", &server_ep).unwrap(), 8);
        let mut buf = [0u8; 64];
        let (n, from) = recv_from(&server, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(
            from.port(),
            client.local_addr().unwrap().as_socket().unwrap().port()
        );
    }

    #[test]
    fn sendfile_transfers_file_contents() {
        let (listener, endpoint) = loopback_listener();
        let client = connect_tcp(&endpoint).unwrap();
        let (server_side, _) = accept(&listener).unwrap().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        let payload = vec![0x5au8; 8192];
        file.write_all(&payload).unwrap();

        let mut offset: libc::off_t = 0;
        let sent = sendfile(&server_side, &file, Some(&mut offset), payload.len()).unwrap();
        assert_eq!(sent, payload.len());
        assert_eq!(offset as usize, payload.len());

        let mut got = Vec::new();
        let mut buf = [0u8; 4096];
        while got.len() < payload.len() {
            let n = recv(&client, &mut buf).unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, payload);
    }

    #[test]
    fn nonblocking_recv_would_block() {
        let (listener, endpoint) = loopback_listener();
        let _client = connect_tcp(&endpoint).unwrap();
        let (server_side, _) = accept(&listener).unwrap().unwrap();
        set_nonblocking(&server_side, true).unwrap();
        let mut buf = [0u8; 8];
        let err = recv(&server_side, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn option_helpers_apply() {
        let (listener, endpoint) = loopback_listener();
        let client = connect_tcp(&endpoint).unwrap();
        let _ = accept(&listener).unwrap().unwrap();
        set_nodelay(&client, true).unwrap();
        set_keepalive(
            &client,
            true,
            Duration::from_secs(30),
            Duration::from_secs(5),
            3,
        )
        .unwrap();
        set_reuse_port(&listener, true).unwrap();
        set_read_timeout(&client, Some(Duration::from_millis(100))).unwrap();
        set_write_timeout(&client, Some(Duration::from_millis(100))).unwrap();

        // the kernel doubles the requested buffer sizes; just confirm
        // the setters took effect
        set_recv_buffer_size(&client, 64 * 1024).unwrap();
        set_send_buffer_size(&client, 64 * 1024).unwrap();
        let sref = SockRef::from(&client);
        assert!(sref.recv_buffer_size().unwrap() >= 64 * 1024);
        assert!(sref.send_buffer_size().unwrap() >= 64 * 1024);
    }
}
