//! Server-role TLS context.

use crate::pem::{load_ca_bundle, load_certs, load_key};
use crate::session::TlsSession;
use crate::{PROTOCOL_VERSIONS, TlsError};
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use std::path::PathBuf;
use std::sync::Arc;

/// Server-side TLS context; one per listening server.
///
/// Built from a certificate/key pair (rustls validates the key matches
/// the certificate). With `verify_peer` enabled, clients must present a
/// certificate chaining to the configured CA bundle.
#[derive(Clone, Debug)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    pub fn builder() -> TlsAcceptorBuilder {
        TlsAcceptorBuilder::default()
    }

    /// Spawn the per-connection session for a freshly accepted fd.
    pub fn session(&self) -> Result<TlsSession, TlsError> {
        let conn = rustls::ServerConnection::new(self.config.clone())?;
        Ok(TlsSession::server(conn))
    }
}

#[derive(Default)]
pub struct TlsAcceptorBuilder {
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    ca: Option<PathBuf>,
    verify_peer: bool,
}

impl TlsAcceptorBuilder {
    /// PEM certificate chain and matching private key.
    pub fn cert_key(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    /// PEM CA bundle used to verify client certificates.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca = Some(path.into());
        self
    }

    /// Require clients to present a certificate.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn build(self) -> Result<TlsAcceptor, TlsError> {
        let cert_path = self.cert.ok_or(TlsError::MissingMaterial("certificate"))?;
        let key_path = self.key.ok_or(TlsError::MissingMaterial("private key"))?;
        let certs = load_certs(&cert_path)?;
        let key = load_key(&key_path)?;

        let builder = ServerConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS);
        let builder = if self.verify_peer {
            let ca_path = self.ca.ok_or(TlsError::MissingCaBundle)?;
            let roots = load_ca_bundle(&ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        // with_single_cert checks that the key matches the certificate
        let config = builder.with_single_cert(certs, key)?;
        Ok(TlsAcceptor {
            config: Arc::new(config),
        })
    }
}
