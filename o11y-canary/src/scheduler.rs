//! Fan-out of series loops and canary supervision.
//!
//! A [`Canary`] runs one periodic loop per (ingest endpoint, series slot),
//! `max_active_canaried_series × ingest endpoints` loops in all, inside a
//! single `JoinSet`. Loops are staggered across one interval and never
//! overlap their own ticks. The [`Supervisor`] owns every canary and the
//! cancellation hierarchy: one process token, one child token per canary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{CanariesConfig, CanaryConfig, IngestProtocol};
use crate::connection::Connection;
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::otlp::OtlpClient;
use crate::probe::{ProbeContext, ProbeCycle, ProbeSettings};
use crate::query::QueryClient;
use crate::remote_write::RemoteWriteClient;
use crate::target::{IngestTarget, QueryTarget};

/// A connected canary, ready to run.
pub struct Canary {
    context: Arc<ProbeContext>,
    interval: Duration,
    max_active_series: usize,
    ingest: Vec<Arc<dyn IngestTarget>>,
}

impl std::fmt::Debug for Canary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canary")
            .field("name", &self.context.canary())
            .field("interval", &self.interval)
            .field("max_active_series", &self.max_active_series)
            .field("ingest_targets", &self.ingest.len())
            .field("query_targets", &self.context.query_targets().len())
            .finish()
    }
}

impl Canary {
    /// Establishes every ingest and query connection for `config`.
    ///
    /// Each ingest endpoint gets a remote-write or OTLP client according to
    /// its `protocol`. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConnectionSetupError`](crate::error::ConnectionSetupError).
    /// Connections already established are released when they drop.
    pub fn connect(name: &str, config: &CanaryConfig, metrics: &MetricsRegistry) -> Result<Self> {
        let canary_tls = config.tls.as_ref();

        let ingest = config
            .ingest
            .iter()
            .map(|endpoint| -> Result<Arc<dyn IngestTarget>> {
                let connection = Arc::new(Connection::connect(endpoint, canary_tls)?);
                let labels = config.additional_labels.clone();
                Ok(match endpoint.protocol {
                    IngestProtocol::RemoteWrite => {
                        Arc::new(RemoteWriteClient::new(connection, labels)) as Arc<dyn IngestTarget>
                    }
                    IngestProtocol::Otlp => {
                        Arc::new(OtlpClient::new(connection, labels)) as Arc<dyn IngestTarget>
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let query = config
            .query
            .iter()
            .map(|endpoint| -> Result<Arc<dyn QueryTarget>> {
                let connection = Arc::new(Connection::connect(endpoint, canary_tls)?);
                Ok(Arc::new(QueryClient::new(connection)) as Arc<dyn QueryTarget>)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_parts(name, config, ingest, query, metrics))
    }

    /// Assembles a canary from already-connected targets.
    pub fn from_parts(
        name: &str,
        config: &CanaryConfig,
        ingest: Vec<Arc<dyn IngestTarget>>,
        query: Vec<Arc<dyn QueryTarget>>,
        metrics: &MetricsRegistry,
    ) -> Self {
        let context = ProbeContext::new(
            name,
            ProbeSettings::from(config),
            config.max_active_series,
            query,
            metrics.for_canary(name),
        );
        Self {
            context: Arc::new(context),
            interval: config.interval,
            max_active_series: config.max_active_series.max(1),
            ingest,
        }
    }

    /// The canary name.
    pub fn name(&self) -> &str {
        self.context.canary()
    }

    /// The shared probe state.
    pub fn context(&self) -> &Arc<ProbeContext> {
        &self.context
    }

    /// Number of concurrent series loops.
    pub fn unit_count(&self) -> usize {
        self.max_active_series * self.ingest.len()
    }

    /// One cycle per (ingest endpoint, series slot), endpoint-major.
    pub fn units(&self) -> Vec<ProbeCycle> {
        self.ingest
            .iter()
            .flat_map(|target| std::iter::repeat_n(target, self.max_active_series))
            .enumerate()
            .map(|(slot, target)| {
                ProbeCycle::new(Arc::clone(&self.context), slot, vec![Arc::clone(target)])
            })
            .collect()
    }

    /// Runs every series loop until `token` is cancelled, then releases each
    /// target exactly once.
    pub async fn run(self, token: CancellationToken) {
        let units = self.units();
        let total = units.len();
        tracing::info!(
            canary = self.name(),
            units = total,
            interval = ?self.interval,
            "canary started"
        );

        let mut loops = JoinSet::new();
        for (index, cycle) in units.into_iter().enumerate() {
            let offset = stagger(self.interval, index, total);
            loops.spawn(run_unit(cycle, self.interval, offset, token.clone()));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(canary = self.name(), error = %e, "series loop failed");
            }
        }

        self.release();
        tracing::info!(canary = self.name(), "canary stopped");
    }

    fn release(&self) {
        for target in &self.ingest {
            target.release();
        }
        for target in self.context.query_targets() {
            target.release();
        }
    }
}

/// Start offset of loop `index` out of `total`, spread evenly over `interval`.
fn stagger(interval: Duration, index: usize, total: usize) -> Duration {
    let total = u32::try_from(total).unwrap_or(u32::MAX).max(1);
    let index = u32::try_from(index).unwrap_or(u32::MAX).min(total - 1);
    interval / total * index
}

/// One series loop: tick, run a cycle, repeat.
///
/// The cycle is raced against cancellation, so shutdown abandons whatever
/// the cycle is waiting on.
async fn run_unit(cycle: ProbeCycle, interval: Duration, offset: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + offset, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            () = token.cancelled() => {
                tracing::debug!(
                    canary = cycle.context().canary(),
                    slot = cycle.slot(),
                    "in-flight cycle abandoned"
                );
                break;
            }
            result = cycle.run_cycle() => {
                tracing::trace!(
                    canary = cycle.context().canary(),
                    slot = cycle.slot(),
                    request_id = %result.request_id,
                    matched = result.query_succeeded(),
                    "cycle complete"
                );
            }
        }
    }
}

/// Starts canaries and stops them together.
#[derive(Debug)]
pub struct Supervisor {
    shutdown: CancellationToken,
    canaries: JoinSet<String>,
    tokens: HashMap<String, CancellationToken>,
}

impl Supervisor {
    /// Creates a supervisor whose canaries all stop when `shutdown` is
    /// cancelled.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            canaries: JoinSet::new(),
            tokens: HashMap::new(),
        }
    }

    /// Connects and starts one canary.
    ///
    /// # Errors
    ///
    /// Returns the connection setup error; nothing is started in that case.
    pub fn start(&mut self, name: &str, config: &CanaryConfig, metrics: &MetricsRegistry) -> Result<()> {
        let canary = Canary::connect(name, config, metrics)?;
        self.spawn(canary);
        Ok(())
    }

    /// Starts every canary in `config`, logging the ones that fail to
    /// connect. Returns how many started.
    pub fn start_all(&mut self, config: &CanariesConfig, metrics: &MetricsRegistry) -> usize {
        let mut started = 0;
        for (name, canary) in &config.canaries {
            match self.start(name, canary, metrics) {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(canary = %name, error = %e, "canary failed to start"),
            }
        }
        started
    }

    /// Runs an already-connected canary under a child token.
    pub fn spawn(&mut self, canary: Canary) {
        let name = canary.name().to_string();
        let token = self.shutdown.child_token();
        self.tokens.insert(name.clone(), token.clone());
        self.canaries.spawn(async move {
            canary.run(token).await;
            name
        });
    }

    /// Stops a single canary. Returns `false` if no canary has that name.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tokens.get(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every canary.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of canaries started and not yet reaped by [`wait`](Self::wait).
    pub fn running(&self) -> usize {
        self.canaries.len()
    }

    /// Waits for every canary to stop.
    pub async fn wait(mut self) {
        while let Some(joined) = self.canaries.join_next().await {
            match joined {
                Ok(name) => tracing::debug!(canary = %name, "canary exited"),
                Err(e) => tracing::error!(error = %e, "canary task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;

    use super::*;
    use crate::config::{EndpointConfig, TlsConfig};
    use crate::target::testing::{FakeBackend, FakeIngest, FakeQuery, QueryMode};

    fn config(max_active_series: usize, interval_ms: u64, write_timeout_ms: u64) -> CanaryConfig {
        let mut config = CanaryConfig {
            max_active_series,
            interval: Duration::from_millis(interval_ms),
            write_timeout: Duration::from_millis(write_timeout_ms),
            query_timeout: Duration::from_secs(1),
            ..CanaryConfig::default()
        };
        config.apply_defaults();
        config
    }

    struct Fixture {
        backend: Arc<FakeBackend>,
        ingest: Vec<Arc<FakeIngest>>,
        query: Vec<Arc<FakeQuery>>,
    }

    impl Fixture {
        fn new(ingest: usize, query: usize) -> Self {
            let backend = FakeBackend::new();
            let ingest = (0..ingest)
                .map(|i| Arc::new(FakeIngest::new(&format!("ingest-{i}"), &backend)))
                .collect();
            let query = (0..query)
                .map(|i| Arc::new(FakeQuery::new(&format!("query-{i}"), &backend, QueryMode::Backend)))
                .collect();
            Self {
                backend,
                ingest,
                query,
            }
        }

        fn canary(&self, name: &str, config: &CanaryConfig, metrics: &MetricsRegistry) -> Canary {
            let ingest = self
                .ingest
                .iter()
                .map(|t| Arc::clone(t) as Arc<dyn IngestTarget>)
                .collect();
            let query = self
                .query
                .iter()
                .map(|t| Arc::clone(t) as Arc<dyn QueryTarget>)
                .collect();
            Canary::from_parts(name, config, ingest, query, metrics)
        }

        fn assert_released_once(&self) {
            for target in &self.ingest {
                assert_eq!(target.release_count(), 1, "{}", target.name);
            }
            for target in &self.query {
                assert_eq!(target.release_count(), 1, "{}", target.name);
            }
        }
    }

    #[test]
    fn test_unit_count_and_layout() {
        let metrics = MetricsRegistry::new().unwrap();
        let fixture = Fixture::new(2, 1);
        let canary = fixture.canary("fanout", &config(3, 1_000, 100), &metrics);

        assert_eq!(canary.unit_count(), 6);
        let units = canary.units();
        assert_eq!(units.len(), 6);
        let slots: Vec<_> = units.iter().map(ProbeCycle::slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_stagger_spreads_over_interval() {
        let interval = Duration::from_secs(4);
        let offsets: Vec<_> = (0..4).map(|i| stagger(interval, i, 4)).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(stagger(interval, 0, 0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cardinality_bounded_across_endpoints() {
        let metrics = MetricsRegistry::new().unwrap();
        let fixture = Fixture::new(2, 1);
        let canary = fixture.canary("bounded", &config(3, 1_000, 100), &metrics);
        let context = Arc::clone(canary.context());

        let token = CancellationToken::new();
        let handle = tokio::spawn(canary.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        handle.await.unwrap();

        let writes = fixture.backend.writes();
        assert!(writes.len() >= 6 * 9, "got {} writes", writes.len());
        let distinct: HashSet<_> = writes.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert_eq!(context.allocator().len(), 3);
        fixture.assert_released_once();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_per_endpoint_includes_settle() {
        let metrics = MetricsRegistry::new().unwrap();
        let backend = FakeBackend::new();
        let ingest: Vec<_> = ["ingest-a", "ingest-b"]
            .into_iter()
            .map(|name| {
                Arc::new(FakeIngest::new(name, &backend).with_delay(Duration::from_millis(500)))
            })
            .collect();
        let query = Arc::new(FakeQuery::new("query", &backend, QueryMode::Backend));
        // Both endpoints rotate the same single ID, 2.5s apart, each
        // settling for 4s
        let canary = Canary::from_parts(
            "pair",
            &config(1, 5_000, 4_000),
            ingest.iter().map(|t| Arc::clone(t) as Arc<dyn IngestTarget>).collect(),
            vec![Arc::clone(&query) as Arc<dyn QueryTarget>],
            &metrics,
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(canary.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(60)).await;
        token.cancel();
        handle.await.unwrap();

        let snap = metrics.for_canary("pair").snapshot();
        assert!(snap.lag_count >= 22, "got {} lags", snap.lag_count);
        assert_eq!(snap.query_successes, snap.lag_count);
        // Every lag is the 500ms write plus the 4s settle
        let mean = snap.lag_sum_seconds / snap.lag_count as f64;
        assert!((mean - 4.5).abs() < 1e-6, "mean lag {mean}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_never_overlap() {
        let metrics = MetricsRegistry::new().unwrap();
        let fixture = Fixture::new(1, 1);
        // Each cycle settles for 3s against a 1s interval
        let canary = fixture.canary("slow", &config(1, 1_000, 3_000), &metrics);

        let token = CancellationToken::new();
        let handle = tokio::spawn(canary.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        token.cancel();
        handle.await.unwrap();

        // Cycles start at 0s, 3s, 6s and 9s
        assert_eq!(fixture.backend.writes().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_in_flight_cycle() {
        let metrics = MetricsRegistry::new().unwrap();
        let backend = FakeBackend::new();
        let ingest = Arc::new(FakeIngest::new("i", &backend));
        let query = Arc::new(
            FakeQuery::new("stuck", &backend, QueryMode::Backend).with_delay(Duration::from_secs(600)),
        );
        let mut config = config(1, 1_000, 100);
        config.query_timeout = Duration::from_secs(900);
        let canary = Canary::from_parts(
            "stuck",
            &config,
            vec![Arc::clone(&ingest) as Arc<dyn IngestTarget>],
            vec![Arc::clone(&query) as Arc<dyn QueryTarget>],
            &metrics,
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(canary.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(query.call_count(), 1);

        let cancelled_at = Instant::now();
        token.cancel();
        handle.await.unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(ingest.release_count(), 1);
        assert_eq!(query.release_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_one_canary_leaves_others_running() {
        let metrics = MetricsRegistry::new().unwrap();
        let first = Fixture::new(1, 1);
        let second = Fixture::new(1, 1);
        let config = config(1, 1_000, 100);

        let mut supervisor = Supervisor::new(CancellationToken::new());
        supervisor.spawn(first.canary("first", &config, &metrics));
        supervisor.spawn(second.canary("second", &config, &metrics));
        assert_eq!(supervisor.running(), 2);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(supervisor.cancel("first"));
        assert!(!supervisor.cancel("missing"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.assert_released_once();
        let first_writes = first.backend.writes().len();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.backend.writes().len(), first_writes);
        assert!(second.backend.writes().len() > first_writes);

        supervisor.shutdown();
        supervisor.wait().await;
        second.assert_released_once();
    }

    #[tokio::test]
    async fn test_failed_canary_does_not_block_others() {
        let metrics = MetricsRegistry::new().unwrap();

        let mut broken = CanaryConfig {
            ingest: vec![EndpointConfig::new("https://insert.example.com/api/v1/write")],
            query: vec![EndpointConfig::new("https://select.example.com")],
            tls: Some(TlsConfig {
                ca_file: Some(PathBuf::from("/definitely/not/here/ca.pem")),
                ..TlsConfig::default()
            }),
            ..CanaryConfig::default()
        };
        broken.apply_defaults();

        let mut healthy = CanaryConfig {
            ingest: vec![EndpointConfig::new("http://127.0.0.1:9/api/v1/write")],
            query: vec![EndpointConfig::new("http://127.0.0.1:9")],
            additional_labels: BTreeMap::from([("env".to_string(), "test".to_string())]),
            ..CanaryConfig::default()
        };
        healthy.apply_defaults();

        let config = CanariesConfig {
            canaries: BTreeMap::from([
                ("broken".to_string(), broken),
                ("healthy".to_string(), healthy),
            ]),
        };

        let shutdown = CancellationToken::new();
        let mut supervisor = Supervisor::new(shutdown.clone());
        assert_eq!(supervisor.start_all(&config, &metrics), 1);
        assert_eq!(supervisor.running(), 1);
        assert!(supervisor.cancel("healthy"));
        assert!(!supervisor.cancel("broken"));

        shutdown.cancel();
        supervisor.wait().await;
    }
}
