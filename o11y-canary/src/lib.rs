//! # o11y-canary
//!
//! Synthetic write-then-query probe for metrics pipelines.
//!
//! A canary periodically pushes a uniquely tagged sample of `canaried_metric`
//! to one or more ingest endpoints (Prometheus remote-write or OTLP/gRPC), waits, then asks one or
//! more Prometheus-compatible query endpoints whether the sample is visible.
//! The time from write to first match is the pipeline's lag; empty results,
//! errors and timeouts are its failures.
//!
//! ## Key Properties
//!
//! - Bounded cardinality: request IDs rotate through a fixed-size pool
//! - One long-lived, TLS-aware connection per endpoint, released exactly once
//! - Every write and query is bounded by a timeout
//! - One independent loop per (ingest endpoint, series slot)
//! - Metrics go to an explicitly passed `prometheus::Registry`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use o11y_canary::{CanariesConfig, MetricsRegistry, Supervisor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CanariesConfig::load("config.yaml")?;
//! config.validate()?;
//!
//! let metrics = MetricsRegistry::new()?;
//! let shutdown = CancellationToken::new();
//!
//! let mut supervisor = Supervisor::new(shutdown.clone());
//! supervisor.start_all(&config, &metrics);
//!
//! tokio::signal::ctrl_c().await?;
//! shutdown.cancel();
//! supervisor.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Supervisor`]: Starts canaries, owns the cancellation hierarchy
//! - [`Canary`]: Connected endpoints plus the series loops that drive them
//! - [`ProbeCycle`]: The write, settle, query, record state machine
//! - [`SeriesIdAllocator`]: Rotating pool of request IDs
//! - [`MetricsRegistry`]: Probe outcome counters and histograms
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration, defaults and validation
//! - [`allocator`]: Request ID pool
//! - [`timestamps`]: Pending-write bookkeeping
//! - [`tls`]: TLS resolution and rustls client configuration
//! - [`connection`]: Long-lived endpoint channels
//! - [`target`]: Ingest and query traits
//! - [`remote_write`]: Prometheus remote-write encoding and push
//! - [`otlp`]: OTLP/gRPC metrics export
//! - [`query`]: Prometheus instant-query client
//! - [`probe`]: Probe cycle engine
//! - [`scheduler`]: Series loops and canary supervision
//! - [`metrics`]: Probe metrics
//! - [`error`]: Error types

pub mod allocator;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod otlp;
pub mod probe;
pub mod query;
pub mod remote_write;
pub mod scheduler;
pub mod target;
pub mod timestamps;
pub mod tls;

// Re-export primary API types at crate root for convenience.
pub use allocator::SeriesIdAllocator;
pub use config::{CanariesConfig, CanaryConfig, EndpointConfig, IngestProtocol, TlsConfig};
pub use connection::Connection;
pub use error::{CanaryError, Result};
pub use metrics::{BuildInfo, CanaryMetrics, MetricsRegistry};
pub use otlp::OtlpClient;
pub use probe::{CycleState, ProbeContext, ProbeCycle, ProbeResult, ProbeSettings};
pub use query::{QueryClient, QueryMatch};
pub use remote_write::RemoteWriteClient;
pub use scheduler::{Canary, Supervisor};
pub use target::{IngestTarget, QueryTarget};
pub use timestamps::InsertionTimestamps;
