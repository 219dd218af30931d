//! End-to-end tests driving a live TCP server with std TcpStream clients.

use parking_lot::Mutex;
use server::{ServerConfig, ServerEvents, TcpServer, WorkerSettings};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn test_config(max_connections: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_connections,
        workers: WorkerSettings {
            min: 1,
            max: 4,
            ..WorkerSettings::default()
        },
        ..ServerConfig::default()
    }
}

#[derive(Default)]
struct EchoEvents {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fds: Mutex<Vec<RawFd>>,
    received: Mutex<Vec<u8>>,
}

impl ServerEvents for EchoEvents {
    fn on_connect(&self, _server: &TcpServer, fd: RawFd, _peer: std::net::SocketAddr) {
        self.fds.lock().push(fd);
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive(&self, server: &TcpServer, fd: RawFd, _peer: std::net::SocketAddr, data: &[u8]) {
        self.received.lock().extend_from_slice(data);
        let _ = server.send(fd, data);
    }

    fn on_disconnect(&self, _server: &TcpServer, _peer: std::net::SocketAddr) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn echo_roundtrip_and_single_disconnect() {
    let events = Arc::new(EchoEvents::default());
    let server = TcpServer::new(&test_config(16), events.clone()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.write_all(b"ABC").unwrap();

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ABC");
    assert_eq!(events.received.lock().as_slice(), b"ABC");
    assert_eq!(events.connects.load(Ordering::SeqCst), 1);

    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        events.disconnects.load(Ordering::SeqCst) == 1
    }));
    // exactly once: give any duplicate a chance to fire
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);

    server.stop();
}

#[test]
fn large_payload_echoes_across_chunks() {
    let events = Arc::new(EchoEvents::default());
    let server = TcpServer::new(&test_config(16), events.clone()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 241) as u8).collect();
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let expected = payload.clone();
    let writer = {
        let mut half = client.try_clone().unwrap();
        let payload = payload.clone();
        std::thread::spawn(move || half.write_all(&payload))
    };

    let mut echoed = Vec::with_capacity(payload.len());
    let mut buf = [0u8; 4096];
    while echoed.len() < payload.len() {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "server closed mid-echo");
        echoed.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap().unwrap();
    assert_eq!(echoed, expected);

    server.stop();
}

#[test]
fn connections_above_cap_are_closed_without_callbacks() {
    let events = Arc::new(EchoEvents::default());
    let server = TcpServer::new(&test_config(1), events.clone()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let _first = TcpStream::connect(addr).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        events.connects.load(Ordering::SeqCst) == 1
    }));

    let mut second = TcpStream::connect(addr).unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 8];
    // the server closes the surplus descriptor without a callback
    assert_eq!(second.read(&mut buf).unwrap(), 0);
    assert_eq!(events.connects.load(Ordering::SeqCst), 1);
    assert_eq!(events.disconnects.load(Ordering::SeqCst), 0);

    server.stop();
}

#[test]
fn broken_pipe_closes_and_removes_connection() {
    let events = Arc::new(EchoEvents::default());
    let server = TcpServer::new(&test_config(16), events.clone()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let client = TcpStream::connect(addr).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        events.connects.load(Ordering::SeqCst) == 1
    }));
    let fd = events.fds.lock()[0];

    // a paused peer: never reads, then dies with data in flight
    let payload = vec![0u8; 16 * 1024 * 1024];
    let sender = {
        let server = server.clone();
        std::thread::spawn(move || server.send(fd, &payload))
    };
    std::thread::sleep(Duration::from_millis(200));
    drop(client);

    let result = sender.join().unwrap();
    assert!(result.is_err(), "send into a dead peer must fail");
    assert!(wait_until(Duration::from_secs(2), || {
        events.disconnects.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(server.connection_count(), 0);

    server.stop();
}

#[test]
fn send_to_all_reaches_every_client() {
    let events = Arc::new(EchoEvents::default());
    let server = TcpServer::new(&test_config(16), events.clone()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let mut clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_until(Duration::from_secs(2), || {
        events.connects.load(Ordering::SeqCst) == 3
    }));

    server.send_to_all(b"blast");
    for client in &mut clients {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"blast");
    }

    server.stop();
}

#[test]
fn restart_reaches_listening_state_again() {
    let events = Arc::new(EchoEvents::default());
    let server = TcpServer::new(&test_config(16), events.clone()).unwrap();
    server.start().unwrap();
    let first_addr = server.local_addr().unwrap();

    let _client = TcpStream::connect(first_addr).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        events.connects.load(Ordering::SeqCst) == 1
    }));

    server.stop();
    assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);

    server.start().unwrap();
    let second_addr = server.local_addr().unwrap();
    let mut client = TcpStream::connect(second_addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.write_all(b"again").unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"again");

    server.stop();
}
