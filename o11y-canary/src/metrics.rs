//! Prometheus metrics describing probe outcomes.
//!
//! A [`MetricsRegistry`] owns every metric family and is passed explicitly to
//! whatever needs it; nothing is registered globally. Each canary records
//! through a [`CanaryMetrics`] handle bound to its name.
//!
//! # Metric Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `o11y_canary_queries_total` | Counter | `canary_name` |
//! | `o11y_canary_query_successes_total` | Counter | `canary_name` |
//! | `o11y_canary_query_errors_total` | Counter | `canary_name`, `reason` |
//! | `o11y_canary_query_duration_seconds` | Histogram | `canary_name` |
//! | `o11y_canary_lag_duration_seconds` | Histogram | `canary_name` |
//! | `o11y_canary_writes_total` | Counter | `canary_name` |
//! | `o11y_canary_write_errors_total` | Counter | `canary_name`, `reason` |
//! | `o11y_canary_info` | Gauge | build/runtime identity |

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{MetricsError, Result};

/// Namespace prefixed to every metric name.
pub const NAMESPACE: &str = "o11y_canary";

/// Bucket boundaries (seconds) for query duration and lag histograms.
pub const DURATION_BUCKETS: &[f64] = &[0.01, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 30.0];

/// `reason` label values of `query_errors_total`.
pub const QUERY_ERROR_REASONS: &[&str] = &["empty", "transport", "timeout"];

/// `reason` label values of `write_errors_total`.
pub const WRITE_ERROR_REASONS: &[&str] = &["timeout", "target"];

/// Identity recorded once in the info gauge.
#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    /// Service version.
    pub version: String,
    /// Configured log level.
    pub log_level: String,
    /// Path of the loaded configuration file.
    pub config_file: String,
    /// Service name.
    pub service_name: String,
    /// Service namespace.
    pub service_namespace: String,
}

/// Owner of the registry and all probe metric families.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    queries_total: IntCounterVec,
    query_successes_total: IntCounterVec,
    query_errors_total: IntCounterVec,
    query_duration_seconds: HistogramVec,
    lag_duration_seconds: HistogramVec,
    writes_total: IntCounterVec,
    write_errors_total: IntCounterVec,
    info: IntGaugeVec,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("families", &self.registry.gather().len())
            .finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// Creates a fresh registry with every probe metric family registered.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] if a family cannot be created
    /// or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queries_total = register(
            &registry,
            IntCounterVec::new(
                opts("queries_total", "Total number of query attempts, including success and failures"),
                &["canary_name"],
            ),
        )?;
        let query_successes_total = register(
            &registry,
            IntCounterVec::new(
                opts("query_successes_total", "Total number of successful queries"),
                &["canary_name"],
            ),
        )?;
        let query_errors_total = register(
            &registry,
            IntCounterVec::new(
                opts("query_errors_total", "Total number of failed queries"),
                &["canary_name", "reason"],
            ),
        )?;
        let query_duration_seconds = register(
            &registry,
            HistogramVec::new(
                histogram_opts("query_duration_seconds", "Duration of successful queries"),
                &["canary_name"],
            ),
        )?;
        let lag_duration_seconds = register(
            &registry,
            HistogramVec::new(
                histogram_opts(
                    "lag_duration_seconds",
                    "Duration of how long metric takes to populate from write to query",
                ),
                &["canary_name"],
            ),
        )?;
        let writes_total = register(
            &registry,
            IntCounterVec::new(
                opts("writes_total", "Total number of samples accepted by ingest targets"),
                &["canary_name"],
            ),
        )?;
        let write_errors_total = register(
            &registry,
            IntCounterVec::new(
                opts("write_errors_total", "Total number of failed writes"),
                &["canary_name", "reason"],
            ),
        )?;
        let info = register(
            &registry,
            IntGaugeVec::new(
                opts("info", "o11y canary information"),
                &[
                    "version",
                    "log_level",
                    "config_file",
                    "service_name",
                    "service_namespace",
                    "service_version",
                ],
            ),
        )?;

        Ok(Self {
            registry,
            queries_total,
            query_successes_total,
            query_errors_total,
            query_duration_seconds,
            lag_duration_seconds,
            writes_total,
            write_errors_total,
            info,
        })
    }

    /// Sets the info gauge to 1 for the given identity.
    pub fn record_info(&self, info: &BuildInfo) {
        self.info
            .with_label_values(&[
                info.version.as_str(),
                info.log_level.as_str(),
                info.config_file.as_str(),
                info.service_name.as_str(),
                info.service_namespace.as_str(),
                info.version.as_str(),
            ])
            .set(1);
    }

    /// Returns a recording handle for one canary.
    ///
    /// Error series for every reason are created at zero so that rare
    /// failures still have a baseline to rate against.
    pub fn for_canary(&self, canary_name: &str) -> CanaryMetrics {
        for &reason in QUERY_ERROR_REASONS {
            self.query_errors_total
                .with_label_values(&[canary_name, reason])
                .inc_by(0);
        }
        for &reason in WRITE_ERROR_REASONS {
            self.write_errors_total
                .with_label_values(&[canary_name, reason])
                .inc_by(0);
        }

        CanaryMetrics {
            name: canary_name.to_string(),
            metrics: self.clone(),
        }
    }

    /// Encodes every family in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Encoding`] if encoding fails.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        let text =
            String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))?;
        Ok(text)
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn histogram_opts(name: &str, help: &str) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .buckets(DURATION_BUCKETS.to_vec())
}

fn register<M>(registry: &Registry, metric: prometheus::Result<M>) -> Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    let metric = metric.map_err(MetricsError::Registration)?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(MetricsError::Registration)?;
    Ok(metric)
}

/// Recording handle bound to one canary's name.
#[derive(Debug, Clone)]
pub struct CanaryMetrics {
    name: String,
    metrics: MetricsRegistry,
}

impl CanaryMetrics {
    /// The canary this handle records for.
    pub fn canary_name(&self) -> &str {
        &self.name
    }

    /// Counts a sample accepted by an ingest target.
    pub fn record_write(&self) {
        self.metrics.writes_total.with_label_values(&[self.name.as_str()]).inc();
    }

    /// Counts a failed write.
    pub fn record_write_error(&self, reason: &str) {
        self.metrics
            .write_errors_total
            .with_label_values(&[self.name.as_str(), reason])
            .inc();
    }

    /// Counts a query attempt.
    pub fn record_query_attempt(&self) {
        self.metrics.queries_total.with_label_values(&[self.name.as_str()]).inc();
    }

    /// Counts a successful query and observes its duration.
    pub fn record_query_success(&self, duration: Duration) {
        self.metrics
            .query_successes_total
            .with_label_values(&[self.name.as_str()])
            .inc();
        self.metrics
            .query_duration_seconds
            .with_label_values(&[self.name.as_str()])
            .observe(duration.as_secs_f64());
    }

    /// Counts a failed query.
    pub fn record_query_error(&self, reason: &str) {
        self.metrics
            .query_errors_total
            .with_label_values(&[self.name.as_str(), reason])
            .inc();
    }

    /// Observes a write-to-query lag.
    pub fn record_lag(&self, lag: Duration) {
        self.metrics
            .lag_duration_seconds
            .with_label_values(&[self.name.as_str()])
            .observe(lag.as_secs_f64());
    }

    /// Current values of this canary's metrics.
    pub fn snapshot(&self) -> CanaryMetricsSnapshot {
        let m = &self.metrics;
        let name = self.name.as_str();
        let query_errors = |reason: &str| m.query_errors_total.with_label_values(&[name, reason]).get();
        let write_errors = |reason: &str| m.write_errors_total.with_label_values(&[name, reason]).get();
        let lag = m.lag_duration_seconds.with_label_values(&[name]);

        CanaryMetricsSnapshot {
            queries: m.queries_total.with_label_values(&[name]).get(),
            query_successes: m.query_successes_total.with_label_values(&[name]).get(),
            query_errors_empty: query_errors("empty"),
            query_errors_transport: query_errors("transport"),
            query_errors_timeout: query_errors("timeout"),
            query_durations: m
                .query_duration_seconds
                .with_label_values(&[name])
                .get_sample_count(),
            lag_count: lag.get_sample_count(),
            lag_sum_seconds: lag.get_sample_sum(),
            writes: m.writes_total.with_label_values(&[name]).get(),
            write_errors_timeout: write_errors("timeout"),
            write_errors_target: write_errors("target"),
        }
    }
}

/// Point-in-time copy of one canary's counters and histogram totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanaryMetricsSnapshot {
    /// `queries_total`.
    pub queries: u64,
    /// `query_successes_total`.
    pub query_successes: u64,
    /// `query_errors_total{reason="empty"}`.
    pub query_errors_empty: u64,
    /// `query_errors_total{reason="transport"}`.
    pub query_errors_transport: u64,
    /// `query_errors_total{reason="timeout"}`.
    pub query_errors_timeout: u64,
    /// Observation count of `query_duration_seconds`.
    pub query_durations: u64,
    /// Observation count of `lag_duration_seconds`.
    pub lag_count: u64,
    /// Observation sum of `lag_duration_seconds`.
    pub lag_sum_seconds: f64,
    /// `writes_total`.
    pub writes: u64,
    /// `write_errors_total{reason="timeout"}`.
    pub write_errors_timeout: u64,
    /// `write_errors_total{reason="target"}`.
    pub write_errors_target: u64,
}

impl CanaryMetricsSnapshot {
    /// Sum of all query error reasons.
    pub fn query_errors(&self) -> u64 {
        self.query_errors_empty + self.query_errors_transport + self.query_errors_timeout
    }
}
