//! Server configuration.
//!
//! Deserializable from TOML; every field has a default so partial
//! configuration files work:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 9000
//! max_connections = 4096
//!
//! [workers]
//! min = 2
//! max = 16
//!
//! [tls]
//! cert = "server.pem"
//! key = "server.key"
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use io_socket::Endpoint;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a TCP server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on; hostname or literal v4/v6.
    pub host: String,
    pub port: u16,
    /// Accepted descriptors above this cap are closed immediately.
    pub max_connections: usize,
    pub workers: WorkerSettings,
    pub tls: Option<TlsSettings>,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            max_connections: 4096,
            workers: WorkerSettings::default(),
            tls: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Worker-pool bounds and cadence for the server's executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub min: usize,
    pub max: usize,
    /// Seconds between scaling checks.
    pub monitor_interval_secs: u64,
    /// Seconds an idle watermark must hold before workers retire.
    pub max_idle_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            min: 2,
            max: std::thread::available_parallelism().map_or(4, |n| n.get()),
            monitor_interval_secs: 5,
            max_idle_secs: 600,
        }
    }
}

impl WorkerSettings {
    pub fn executor_config(&self) -> executor::ExecutorConfig {
        executor::ExecutorConfig {
            min_size: self.min,
            max_size: self.max,
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
            max_idle: Duration::from_secs(self.max_idle_secs),
        }
    }
}

/// Paths and policy for the TLS listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key matching `cert`.
    pub key: PathBuf,
    /// CA bundle for client-certificate verification.
    pub ca: Option<PathBuf>,
    /// Require clients to present a certificate.
    #[serde(default)]
    pub verify_peer: bool,
}

impl TlsSettings {
    pub fn acceptor(&self) -> Result<io_tls::TlsAcceptor, io_tls::TlsError> {
        let mut builder = io_tls::TlsAcceptor::builder()
            .cert_key(&self.cert, &self.key)
            .verify_peer(self.verify_peer);
        if let Some(ca) = &self.ca {
            builder = builder.ca_file(ca);
        }
        builder.build()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

/// Logging subsystem configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    /// Include the event's target module.
    pub target: bool,
    /// Include thread names.
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            timestamps: true,
            target: false,
            thread_names: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_connections, 4096);
        assert!(config.tls.is_none());
        assert!(config.workers.min <= config.workers.max);
    }

    #[test]
    fn parses_minimal_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.endpoint().to_string(), "127.0.0.1:9000");
        assert_eq!(config.max_connections, 4096);
    }

    #[test]
    fn parses_full_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            host = "::"
            port = 8443
            max_connections = 128

            [workers]
            min = 1
            max = 8

            [tls]
            cert = "server.pem"
            key = "server.key"
            ca = "clients.pem"
            verify_peer = true

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            "#,
        )
        .unwrap();
        assert_eq!(config.max_connections, 128);
        assert_eq!(config.workers.max, 8);
        let tls = config.tls.unwrap();
        assert!(tls.verify_peer);
        assert_eq!(tls.cert, PathBuf::from("server.pem"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn unknown_fields_rejected() {
        let result: Result<ServerConfig, _> = toml::from_str("bogus = true");
        assert!(result.is_err());
    }
}
