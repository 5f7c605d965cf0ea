//! Error types for the o11y-canary probe engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all canary operations.
///
/// Only [`ConnectionSetupError`] and [`ConfigError`] stop anything: the first
/// prevents a single canary from starting, the second prevents the process
/// from starting. Write and query failures are recorded and the owning cycle
/// carries on.
#[derive(Error, Debug)]
pub enum CanaryError {
    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error establishing an outbound channel at canary startup.
    #[error("connection setup error: {0}")]
    Connection(#[from] ConnectionSetupError),

    /// Error during the write step of a probe cycle.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Error during the query step of a probe cycle.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error registering or encoding probe metrics.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

/// Errors that can occur when loading canary configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid YAML for the expected shape.
    #[error("failed to parse config: {source}")]
    Parse {
        /// The YAML decoding error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A canary definition failed validation.
    #[error("canary '{canary}': {reason}")]
    Invalid {
        /// Name of the offending canary.
        canary: String,
        /// Description of what is wrong.
        reason: String,
    },
}

/// Errors that can occur while setting up an endpoint connection.
///
/// These are fatal to the owning canary only.
#[derive(Error, Debug)]
pub enum ConnectionSetupError {
    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint url '{url}': {source}")]
    InvalidUrl {
        /// The URL as configured.
        url: String,
        /// The parse error.
        #[source]
        source: url::ParseError,
    },

    /// The endpoint URL uses a scheme other than http or https.
    #[error("unsupported scheme '{scheme}' in endpoint url '{url}'")]
    UnsupportedScheme {
        /// The URL as configured.
        url: String,
        /// The offending scheme.
        scheme: String,
    },

    /// A TLS file (CA bundle, certificate or key) could not be read.
    #[error("failed to read TLS material '{}': {source}", path.display())]
    TlsMaterialRead {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A TLS file was read but its PEM content is unusable.
    #[error("invalid TLS material '{}': {reason}", path.display())]
    TlsMaterialInvalid {
        /// The file path.
        path: PathBuf,
        /// Description of what was wrong.
        reason: String,
    },

    /// Only one half of a client certificate/key pair was configured.
    #[error("client certificate and key must be configured together")]
    IncompleteClientAuth,

    /// The server-name override is not a valid DNS name or IP address.
    #[error("invalid TLS server name '{name}'")]
    InvalidServerName {
        /// The configured override.
        name: String,
    },

    /// rustls rejected the assembled configuration.
    #[error("TLS configuration rejected: {source}")]
    Tls {
        /// The rustls error.
        #[source]
        source: rustls::Error,
    },

    /// The certificate verifier could not be built from the root store.
    #[error("failed to build certificate verifier: {reason}")]
    Verifier {
        /// Description of the failure.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The URL is not usable as a gRPC endpoint.
    #[error("invalid gRPC endpoint '{url}': {source}")]
    GrpcEndpoint {
        /// The URL as configured.
        url: String,
        /// The tonic transport error.
        #[source]
        source: tonic::transport::Error,
    },
}

/// Transport-level failure talking to a single ingest or query target.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection has already been released.
    #[error("connection to '{target}' is closed")]
    ConnectionClosed {
        /// The target URL.
        target: String,
    },

    /// Failed to serialize the write request to protobuf.
    #[error("failed to serialize write request: {source}")]
    Serialization {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Failed to compress the write request with Snappy.
    #[error("failed to compress data: {source}")]
    Compression {
        /// The snappy compression error.
        #[source]
        source: snap::Error,
    },

    /// The HTTP request could not be completed.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The connection speaks a different protocol than the caller needs.
    #[error("connection to '{target}' does not carry {expected}")]
    ProtocolMismatch {
        /// The target URL.
        target: String,
        /// The channel kind the caller asked for.
        expected: &'static str,
    },

    /// The gRPC export call failed.
    #[error("gRPC export failed: {source}")]
    Grpc {
        /// The status returned by the collector or the channel.
        #[source]
        source: Box<tonic::Status>,
    },

    /// The collector accepted the export but rejected data points.
    #[error("collector rejected {rejected} data point(s): {message}")]
    Rejected {
        /// Number of rejected data points.
        rejected: i64,
        /// The collector's explanation.
        message: String,
    },

    /// The server answered with a non-2xx status.
    #[error("server returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The query response body is not the expected JSON.
    #[error("failed to decode query response: {source}")]
    Decode {
        /// The JSON decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// The query API reported an error in its response envelope.
    #[error("query API error ({error_type}): {message}")]
    Api {
        /// The `errorType` field of the response.
        error_type: String,
        /// The `error` field of the response.
        message: String,
    },
}

/// Errors from the write step of a probe cycle.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The write step for all targets did not finish within `write_timeout`.
    #[error("write step timed out after {timeout:?}")]
    Timeout {
        /// The configured write timeout.
        timeout: Duration,
    },

    /// A single ingest target rejected or failed the write.
    #[error("write to '{target}' failed: {source}")]
    Target {
        /// The ingest target URL.
        target: String,
        /// What went wrong.
        #[source]
        source: TransportError,
    },
}

impl WriteError {
    /// Label value used for the `reason` dimension of write error counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Target { .. } => "target",
        }
    }
}

/// Errors from the query step of a probe cycle.
///
/// The three variants are distinct failure kinds and are counted separately.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query did not complete within `query_timeout`.
    #[error("query against '{target}' timed out after {timeout:?}")]
    Timeout {
        /// The query target URL.
        target: String,
        /// The configured query timeout.
        timeout: Duration,
    },

    /// The query succeeded but matched no series.
    #[error("query against '{target}' returned no series for {query}")]
    EmptyResult {
        /// The query target URL.
        target: String,
        /// The expression that was evaluated.
        query: String,
    },

    /// The query failed at the transport or API level.
    #[error("query against '{target}' failed: {source}")]
    Transport {
        /// The query target URL.
        target: String,
        /// What went wrong.
        #[source]
        source: TransportError,
    },
}

impl QueryError {
    /// Label value used for the `reason` dimension of query error counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::EmptyResult { .. } => "empty",
            Self::Transport { .. } => "transport",
        }
    }
}

/// Errors that can occur during metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to register a metric with the registry.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Type alias for `Result<T, CanaryError>`.
pub type Result<T> = std::result::Result<T, CanaryError>;
