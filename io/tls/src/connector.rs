//! Client-role TLS context.

use crate::pem::{load_ca_bundle, load_certs, load_key};
use crate::session::TlsSession;
use crate::{PROTOCOL_VERSIONS, TlsError};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::PathBuf;
use std::sync::Arc;

/// Client-side TLS context; one per client.
///
/// Verifies the server against a CA bundle (or the webpki roots when
/// none is configured). Verification can be disabled for lab setups,
/// and a certificate/key pair can be attached for mutual TLS.
#[derive(Clone, Debug)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn builder() -> TlsConnectorBuilder {
        TlsConnectorBuilder::default()
    }

    /// Spawn the per-connection session for a connected fd.
    /// `server_name` is the DNS name or IP literal the peer must prove.
    pub fn session(&self, server_name: &str) -> Result<TlsSession, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let conn = rustls::ClientConnection::new(self.config.clone(), name)?;
        Ok(TlsSession::client(conn))
    }
}

pub struct TlsConnectorBuilder {
    ca: Option<PathBuf>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    verify_peer: bool,
}

impl Default for TlsConnectorBuilder {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            verify_peer: true,
        }
    }
}

impl TlsConnectorBuilder {
    /// PEM CA bundle the server certificate must chain to.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca = Some(path.into());
        self
    }

    /// Client certificate chain and key for mutual TLS.
    pub fn cert_key(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    /// Toggle server-certificate verification. Defaults to on; turning
    /// it off accepts any certificate and is only suitable for tests.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn build(self) -> Result<TlsConnector, TlsError> {
        let builder = ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS);
        let builder = if self.verify_peer {
            let roots = match &self.ca {
                Some(path) => load_ca_bundle(path)?,
                None => RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            };
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        };

        let config = match (self.cert, self.key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(&cert_path)?;
                let key = load_key(&key_path)?;
                builder.with_client_auth_cert(certs, key)?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(TlsConnector {
            config: Arc::new(config),
        })
    }
}

/// Verifier that accepts any server certificate.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
