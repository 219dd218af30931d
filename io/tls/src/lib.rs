//! TLS contexts and per-connection sessions over rustls.
//!
//! One context exists per role: [`TlsAcceptor`] for servers and
//! [`TlsConnector`] for clients. Each accepted or connected descriptor
//! gets its own [`TlsSession`]; handshake and data operations report
//! would-block (`WANT_READ`/`WANT_WRITE`) as
//! [`std::io::ErrorKind::WouldBlock`] so callers retry on the next
//! readiness event. The protocol floor is TLS 1.2.

mod acceptor;
mod connector;
mod pem;
mod session;

pub use acceptor::{TlsAcceptor, TlsAcceptorBuilder};
pub use connector::{TlsConnector, TlsConnectorBuilder};
pub use session::{HandshakeStatus, TlsSession};

/// Protocol versions offered by either role: TLS 1.3 preferred, TLS 1.2
/// as the floor.
pub(crate) static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Errors building a TLS context.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("missing {0} path")]
    MissingMaterial(&'static str),
    #[error("a ca bundle is required when peer verification is enabled")]
    MissingCaBundle,
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("tls error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}
