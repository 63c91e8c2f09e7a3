//! Configuration schema definitions.
//!
//! Every section and field has a default, so an empty file (or no file)
//! yields a working TLS server on port 443.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::security::limits::{DEFAULT_BODY_LIMIT_MB, MAX_CONNECTIONS};

/// Root configuration for the web server core.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listener: ListenerConfig,
    pub tls: TlsConfig,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub auth: AuthConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:443").
    pub bind_address: String,

    /// Terminate TLS on accepted sockets.
    pub tls: bool,

    /// Connection ceiling checked when a connection starts.
    pub max_connections: usize,

    /// Use the socket passed by the service manager when one is present.
    pub inherit_socket: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:443".to_string(),
            tls: true,
            max_connections: MAX_CONNECTIONS,
            inherit_socket: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory watched for certificate rewrites.
    pub cert_dir: PathBuf,

    /// Certificate chain and private key, in one PEM file under `cert_dir`.
    pub cert_file: String,

    /// Directory of CA certificates trusted for client authentication.
    pub trust_store: PathBuf,

    /// Advertise `h2` over ALPN.
    pub http2: bool,

    /// Request client certificates.
    pub mutual_tls: bool,
}

impl TlsConfig {
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.cert_file)
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("/etc/ssl/certs/https/"),
            cert_file: "server.pem".to_string(),
            trust_store: PathBuf::from("/etc/ssl/certs/authority"),
            http2: true,
            mutual_tls: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest request body accepted from an authenticated caller, in MiB.
    pub body_limit_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            body_limit_mb: DEFAULT_BODY_LIMIT_MB,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for each read or write phase of a connection.
    pub response_secs: u64,

    /// How long shutdown waits for open connections.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            response_secs: 60,
            drain_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a session for paths outside the allowlist.
    pub enabled: bool,

    /// Extra paths reachable by `GET` without a session.
    pub allowlist: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,

    pub json_logs: bool,

    /// Prometheus exporter address; no exporter when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_address: None,
        }
    }
}
