//! Configuration for the GPU exporter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::auth::BasicAuth;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// HTTP endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Collection cycle settings.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Address to listen on (default: ":9445", every interface).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Serve over HTTPS with this certificate.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Users allowed in, mapped to the hex SHA-256 digest of their password.
    /// Empty disables authentication.
    #[serde(default)]
    pub basic_auth_users: BTreeMap<String, String>,
}

/// TLS certificate and key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

fn default_listen() -> String {
    ":9445".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            tls: None,
            basic_auth_users: BTreeMap::new(),
        }
    }
}

impl WebConfig {
    /// Socket address to bind. A bare `:port` means every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let listen = self.listen.trim();
        let addr = match listen.strip_prefix(':') {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .map(|port| SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))),
            None => listen.parse().ok(),
        };

        addr.ok_or_else(|| {
            ConfigError::Validation(format!("Invalid listen address: {}", self.listen))
        })
    }

    /// Credentials to enforce, `None` when no users are configured.
    pub fn basic_auth(&self) -> Result<Option<BasicAuth>, ConfigError> {
        if self.basic_auth_users.is_empty() {
            return Ok(None);
        }

        if let Some(user) = self
            .basic_auth_users
            .keys()
            .find(|u| u.is_empty() || u.contains(':'))
        {
            return Err(ConfigError::Validation(format!(
                "Invalid basic auth username: {:?}",
                user
            )));
        }

        BasicAuth::from_hashes(&self.basic_auth_users)
            .map(Some)
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "Basic auth password must be a hex SHA-256 digest: {}",
                    e
                ))
            })
    }
}

/// Collection cycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Metric name prefix (default: "nvidia_gpu").
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// How long a scrape waits for a running cycle before giving up
    /// (seconds, 0 = wait indefinitely).
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_namespace() -> String {
    "nvidia_gpu".to_string()
}

fn default_lock_timeout() -> u64 {
    30
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

impl CollectorConfig {
    /// Lock timeout as a duration, `None` when waiting indefinitely.
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_secs > 0).then(|| Duration::from_secs(self.lock_timeout_secs))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Check that `name` can prefix a Prometheus metric name.
///
/// Metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn is_valid_namespace(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        None => true,
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        Some(_) => false,
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.web.listen_addr()?;

        if !self.web.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        // Both are served by fixed routes.
        if self.web.path == "/" || self.web.path == "/health" {
            return Err(ConfigError::Validation(format!(
                "Metrics path must not be {}",
                self.web.path
            )));
        }

        // Route pattern syntax would turn the path into a capture.
        if self.web.path.contains(['*', ':', '{', '}']) {
            return Err(ConfigError::Validation(format!(
                "Metrics path must not contain route pattern characters: {}",
                self.web.path
            )));
        }

        if let Some(tls) = &self.web.tls {
            if tls.cert_file.as_os_str().is_empty() || tls.key_file.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "TLS needs both cert_file and key_file".to_string(),
                ));
            }
        }

        self.web.basic_auth()?;

        if !is_valid_namespace(&self.collector.namespace) {
            return Err(ConfigError::Validation(format!(
                "Invalid metric namespace: {}",
                self.collector.namespace
            )));
        }

        Ok(())
    }
}
