//! TLS client against a TLS server: handshake and a 1 MiB payload
//! delivered byte-for-byte across 4 KiB receive chunks.

use client::{ClientEvents, TcpClient};
use io_socket::Endpoint;
use io_tls::TlsConnector;
use parking_lot::Mutex;
use server::{ServerConfig, ServerEvents, TcpServer, TlsSettings, WorkerSettings};
use std::io::Write;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const PAYLOAD_LEN: usize = 1024 * 1024;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

struct CertFiles {
    cert: tempfile::NamedTempFile,
    key: tempfile::NamedTempFile,
}

fn self_signed() -> CertFiles {
    let cert =
        rcgen::generate_simple_self_signed(vec!["localhost".into(), "127.0.0.1".into()]).unwrap();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file
        .write_all(cert.key_pair.serialize_pem().as_bytes())
        .unwrap();
    CertFiles {
        cert: cert_file,
        key: key_file,
    }
}

/// Accumulates payload bytes; replies "done" once the full payload has
/// arrived.
#[derive(Default)]
struct Sink {
    received: Mutex<Vec<u8>>,
    chunks: AtomicUsize,
}

impl ServerEvents for Sink {
    fn on_receive(&self, server: &TcpServer, fd: RawFd, _peer: SocketAddr, data: &[u8]) {
        assert!(data.len() <= 4096, "receive chunks are bounded by the buffer");
        self.chunks.fetch_add(1, Ordering::SeqCst);
        let total = {
            let mut received = self.received.lock();
            received.extend_from_slice(data);
            received.len()
        };
        if total >= PAYLOAD_LEN {
            let _ = server.send(fd, b"done");
        }
    }
}

#[derive(Default)]
struct ClientCapture {
    received: Mutex<Vec<u8>>,
}

impl ClientEvents for ClientCapture {
    fn on_receive(&self, _client: &TcpClient, _peer: SocketAddr, data: &[u8]) {
        self.received.lock().extend_from_slice(data);
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
fn tls_payload_arrives_byte_for_byte() {
    let certs = self_signed();
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers: WorkerSettings {
            min: 1,
            max: 4,
            ..WorkerSettings::default()
        },
        tls: Some(TlsSettings {
            cert: certs.cert.path().to_path_buf(),
            key: certs.key.path().to_path_buf(),
            ca: None,
            verify_peer: false,
        }),
        ..ServerConfig::default()
    };

    let sink = Arc::new(Sink::default());
    let server = TcpServer::new(&config, sink.clone()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    // the client verifies the server against the self-signed cert
    let connector = TlsConnector::builder()
        .ca_file(certs.cert.path())
        .build()
        .unwrap();
    let capture = Arc::new(ClientCapture::default());
    let client = TcpClient::with_tls(
        Endpoint::new("127.0.0.1", addr.port()),
        capture.clone(),
        connector,
    );
    client.start().unwrap();
    assert!(client.is_connected());

    let data = payload();
    assert_eq!(client.send(&data).unwrap(), data.len());

    assert!(
        wait_until(Duration::from_secs(20), || {
            capture.received.lock().as_slice() == b"done"
        }),
        "server never acknowledged the full payload"
    );

    let received = sink.received.lock();
    assert_eq!(received.len(), PAYLOAD_LEN);
    assert_eq!(received.as_slice(), data.as_slice());
    assert!(
        sink.chunks.load(Ordering::SeqCst) >= PAYLOAD_LEN / 4096,
        "payload must cross the receive callback in multiple chunks"
    );
    drop(received);

    client.stop();
    server.stop();
}

#[test]
fn untrusted_server_is_rejected() {
    let server_certs = self_signed();
    let other_certs = self_signed();
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        tls: Some(TlsSettings {
            cert: server_certs.cert.path().to_path_buf(),
            key: server_certs.key.path().to_path_buf(),
            ca: None,
            verify_peer: false,
        }),
        ..ServerConfig::default()
    };

    let server = TcpServer::new(&config, Arc::new(Sink::default())).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    // the client trusts a different CA, so the handshake must fail
    let connector = TlsConnector::builder()
        .ca_file(other_certs.cert.path())
        .build()
        .unwrap();
    let client = TcpClient::with_tls(
        Endpoint::new("127.0.0.1", addr.port()),
        Arc::new(ClientCapture::default()),
        connector,
    );
    assert!(client.start().is_err());
    assert!(!client.is_connected());

    server.stop();
}
