//! Canary configuration types.
//!
//! Configuration is loaded once from YAML at startup and is immutable for the
//! lifetime of each canary. The file holds a single `canary:` mapping from
//! canary name to [`CanaryConfig`]:
//!
//! ```yaml
//! canary:
//!   vm_cluster:
//!     interval: 15s
//!     write_timeout: 5s
//!     query_timeout: 30s
//!     max_active_canaried_series: 20
//!     tls:
//!       ca_file: /etc/canary/ca.pem
//!     ingest:
//!       - https://vminsert.example.com/api/v1/write
//!       - url: https://otel-gw.example.com:4317
//!         protocol: otlp
//!         tls:
//!           insecure_skip_verify: true
//!     query:
//!       - https://vmselect.example.com/select/0/prometheus
//!     additional_labels:
//!       environment: staging
//! ```
//!
//! Zero or missing values are replaced by defaults in
//! [`CanariesConfig::apply_defaults`], which [`CanariesConfig::load`] calls.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default cardinality ceiling per canary.
pub const DEFAULT_MAX_ACTIVE_SERIES: usize = 50;
/// Default time between probe cycles of one series slot.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
/// Default bound on the write step (and length of the settle pause).
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on each query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
/// The only canary type the probe engine runs.
pub const METRICS_CANARY: &str = "metrics";

/// Top-level configuration: every canary keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanariesConfig {
    /// Canary definitions keyed by canary name.
    #[serde(default, rename = "canary")]
    pub canaries: BTreeMap<String, CanaryConfig>,
}

impl CanariesConfig {
    /// Reads, parses and default-fills a configuration file.
    ///
    /// Validation is a separate step so callers can report every problem
    /// with the file before deciding to exit.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid YAML for this shape.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Parses configuration from a YAML string without applying defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::Parse { source: e })
            .map_err(Into::into)
    }

    /// Fills zero or empty fields of every canary with their defaults.
    pub fn apply_defaults(&mut self) {
        for canary in self.canaries.values_mut() {
            canary.apply_defaults();
        }
    }

    /// Validates every canary definition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first canary that fails.
    pub fn validate(&self) -> Result<()> {
        for (name, canary) in &self.canaries {
            canary.validate(name)?;
        }
        Ok(())
    }
}

/// Configuration for a single canary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Canary type. Only `metrics` is runnable.
    #[serde(default, rename = "type")]
    pub kind: String,

    /// Endpoints synthetic samples are pushed to.
    #[serde(default)]
    pub ingest: Vec<EndpointConfig>,

    /// Endpoints queried to confirm samples became visible.
    #[serde(default)]
    pub query: Vec<EndpointConfig>,

    /// Extra labels attached to every synthetic sample.
    #[serde(default)]
    pub additional_labels: BTreeMap<String, String>,

    /// Time between cycles of one series slot.
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,

    /// Bound on the write step; also the settle pause before querying.
    #[serde(default, with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Bound on each individual query.
    #[serde(default, with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Cardinality ceiling: maximum distinct request IDs kept in rotation.
    #[serde(default, rename = "max_active_canaried_series")]
    pub max_active_series: usize,

    /// Canary-level TLS default for endpoints without their own block.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl CanaryConfig {
    /// Replaces zero or empty fields with their defaults.
    pub fn apply_defaults(&mut self) {
        if self.max_active_series == 0 {
            self.max_active_series = DEFAULT_MAX_ACTIVE_SERIES;
        }
        if self.interval.is_zero() {
            self.interval = DEFAULT_INTERVAL;
        }
        if self.write_timeout.is_zero() {
            self.write_timeout = DEFAULT_WRITE_TIMEOUT;
        }
        if self.query_timeout.is_zero() {
            self.query_timeout = DEFAULT_QUERY_TIMEOUT;
        }
        if self.kind.is_empty() {
            self.kind = METRICS_CANARY.to_string();
        }
    }

    /// Validates a default-filled canary definition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: String| -> crate::error::CanaryError {
            ConfigError::Invalid {
                canary: name.to_string(),
                reason,
            }
            .into()
        };

        if self.kind != METRICS_CANARY {
            return Err(invalid(format!(
                "unsupported canary type '{}' (expected '{METRICS_CANARY}')",
                self.kind
            )));
        }
        if self.ingest.is_empty() {
            return Err(invalid("at least one ingest endpoint is required".into()));
        }
        if self.query.is_empty() {
            return Err(invalid("at least one query endpoint is required".into()));
        }
        if self.max_active_series == 0 {
            return Err(invalid("max_active_canaried_series must be > 0".into()));
        }
        if self.interval.is_zero() || self.write_timeout.is_zero() || self.query_timeout.is_zero() {
            return Err(invalid("interval and timeouts must be > 0".into()));
        }

        if let Some(endpoint) = self
            .query
            .iter()
            .find(|e| e.protocol != IngestProtocol::RemoteWrite)
        {
            return Err(invalid(format!(
                "query endpoint '{}' cannot use protocol '{}'",
                endpoint.url, endpoint.protocol
            )));
        }

        for endpoint in self.ingest.iter().chain(&self.query) {
            match url::Url::parse(&endpoint.url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => {
                    return Err(invalid(format!(
                        "endpoint '{}' must use http or https, not '{}'",
                        endpoint.url,
                        parsed.scheme()
                    )));
                }
                Err(e) => {
                    return Err(invalid(format!("endpoint '{}': {e}", endpoint.url)));
                }
            }
            if let Some(tls) = &endpoint.tls {
                tls.validate().map_err(|reason| {
                    invalid(format!("endpoint '{}' tls: {reason}", endpoint.url))
                })?;
            }
        }

        if let Some(tls) = &self.tls {
            tls.validate().map_err(|reason| invalid(format!("tls: {reason}")))?;
        }

        Ok(())
    }

    /// Number of concurrent series loops this canary runs.
    pub fn unit_count(&self) -> usize {
        self.max_active_series * self.ingest.len()
    }
}

/// Wire protocol an ingest endpoint accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestProtocol {
    /// Prometheus remote-write 0.1.0 over HTTP. The URL is the push URL.
    #[default]
    RemoteWrite,
    /// OTLP metrics export over gRPC. Only the URL's origin is used.
    Otlp,
}

impl std::fmt::Display for IngestProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RemoteWrite => "remote_write",
            Self::Otlp => "otlp",
        })
    }
}

/// An ingest or query endpoint.
///
/// In YAML an endpoint may be a bare URL string or a mapping with `url`, an
/// optional `tls` block and, for ingest endpoints, an optional `protocol`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EndpointRepr")]
pub struct EndpointConfig {
    /// Endpoint URL.
    pub url: String,
    /// Endpoint-level TLS; when present it replaces the canary default whole.
    pub tls: Option<TlsConfig>,
    /// Push protocol. Query endpoints always use the Prometheus HTTP API.
    pub protocol: IngestProtocol,
}

impl EndpointConfig {
    /// Creates a plain remote-write endpoint without its own TLS block.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tls: None,
            protocol: IngestProtocol::default(),
        }
    }

    /// Sets the push protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: IngestProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the endpoint-level TLS block.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointRepr {
    Url(String),
    Full {
        url: String,
        #[serde(default)]
        tls: Option<TlsConfig>,
        #[serde(default)]
        protocol: IngestProtocol,
    },
}

impl From<EndpointRepr> for EndpointConfig {
    fn from(repr: EndpointRepr) -> Self {
        match repr {
            EndpointRepr::Url(url) => Self::new(url),
            EndpointRepr::Full { url, tls, protocol } => Self { url, tls, protocol },
        }
    }
}

/// TLS parameters for an endpoint or a canary-level default.
///
/// Client certificate and key are paths, and are read from disk on every
/// connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether TLS is used at all. A present block defaults to enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// PEM bundle of CA certificates to trust instead of the bundled roots.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// PEM client certificate chain for mutual TLS.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// PEM private key matching `cert_file`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Name to verify the server certificate against instead of the URL host.
    #[serde(default)]
    pub server_name: Option<String>,

    /// Skip server certificate verification entirely.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_file: None,
            cert_file: None,
            key_file: None,
            server_name: None,
            insecure_skip_verify: false,
        }
    }
}

impl TlsConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err("cert_file and key_file must be set together".to_string());
        }
        if self.server_name.as_deref().is_some_and(str::is_empty) {
            return Err("server_name must not be empty".to_string());
        }
        Ok(())
    }
}
