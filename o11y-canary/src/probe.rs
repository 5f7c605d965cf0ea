//! The write, settle, query, record cycle.
//!
//! One [`ProbeCycle`] belongs to one series loop. Every tick it takes a
//! request ID from the canary's allocator, pushes a sample tagged with it,
//! pauses for `write_timeout`, then asks every query target whether the sample
//! is visible. The first match for an ID yields the lag measurement.
//!
//! Failures never escape a cycle: they are logged, counted and returned in
//! the [`ProbeResult`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::Instrument;

use crate::allocator::SeriesIdAllocator;
use crate::config::CanaryConfig;
use crate::error::{QueryError, WriteError};
use crate::metrics::CanaryMetrics;
use crate::query::canary_query;
use crate::target::{IngestTarget, QueryTarget};
use crate::timestamps::InsertionTimestamps;

/// States a cycle passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Waiting for the next tick.
    Idle,
    /// Pushing the sample to ingest targets.
    Writing,
    /// Pausing before the first query.
    Settling,
    /// Querying every query target.
    Querying,
    /// Recording lag for the first match.
    Recording,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Writing => "writing",
            Self::Settling => "settling",
            Self::Querying => "querying",
            Self::Recording => "recording",
        };
        f.write_str(name)
    }
}

/// Timeouts governing one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Bound on the whole write step, and the settle pause.
    pub write_timeout: Duration,
    /// Bound on each individual query.
    pub query_timeout: Duration,
}

impl From<&CanaryConfig> for ProbeSettings {
    fn from(config: &CanaryConfig) -> Self {
        Self {
            write_timeout: config.write_timeout,
            query_timeout: config.query_timeout,
        }
    }
}

/// State shared by every series loop of one canary.
pub struct ProbeContext {
    canary: String,
    settings: ProbeSettings,
    query: Vec<Arc<dyn QueryTarget>>,
    allocator: SeriesIdAllocator,
    timestamps: InsertionTimestamps,
    metrics: CanaryMetrics,
}

impl fmt::Debug for ProbeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeContext")
            .field("canary", &self.canary)
            .field("settings", &self.settings)
            .field("query_targets", &self.query.len())
            .field("allocator", &self.allocator)
            .field("timestamps", &self.timestamps)
            .finish_non_exhaustive()
    }
}

impl ProbeContext {
    /// Creates the shared state for a canary.
    pub fn new(
        canary: impl Into<String>,
        settings: ProbeSettings,
        max_active_series: usize,
        query: Vec<Arc<dyn QueryTarget>>,
        metrics: CanaryMetrics,
    ) -> Self {
        Self {
            canary: canary.into(),
            settings,
            query,
            allocator: SeriesIdAllocator::new(max_active_series),
            timestamps: InsertionTimestamps::new(),
            metrics,
        }
    }

    /// The canary name.
    pub fn canary(&self) -> &str {
        &self.canary
    }

    /// The cycle timeouts.
    pub fn settings(&self) -> ProbeSettings {
        self.settings
    }

    /// The query targets probed by every cycle.
    pub fn query_targets(&self) -> &[Arc<dyn QueryTarget>] {
        &self.query
    }

    /// The request ID allocator.
    pub fn allocator(&self) -> &SeriesIdAllocator {
        &self.allocator
    }

    /// Pending writes awaiting their first match.
    pub fn timestamps(&self) -> &InsertionTimestamps {
        &self.timestamps
    }

    /// The canary's metric handle.
    pub fn metrics(&self) -> &CanaryMetrics {
        &self.metrics
    }

    /// Consumes the pending write `slot` made for `request_id` and records
    /// its lag.
    ///
    /// Returns `None` when there is nothing pending, which happens for every
    /// match after the first.
    pub fn record_match(&self, slot: usize, request_id: &str) -> Option<Duration> {
        let lag = self.timestamps.take_elapsed(slot, request_id, Instant::now())?;
        self.metrics.record_lag(lag);
        tracing::debug!(canary = %self.canary, slot, request_id, lag = ?lag, "lag recorded");
        Some(lag)
    }
}

/// One attempt against a query target.
#[derive(Debug)]
pub struct QueryAttempt {
    /// The query target.
    pub target: String,
    /// Time from issuing the query to its outcome.
    pub duration: Duration,
    /// The outcome.
    pub result: std::result::Result<(), QueryError>,
}

/// Outcome of one cycle.
#[derive(Debug)]
pub struct ProbeResult {
    /// The request ID the cycle wrote and queried.
    pub request_id: String,
    /// Last state reached before returning to idle.
    pub last_state: CycleState,
    /// One entry per ingest target, or a single timeout entry.
    pub writes: Vec<std::result::Result<(), WriteError>>,
    /// One entry per query target; empty if the cycle ended while writing.
    pub queries: Vec<QueryAttempt>,
    /// Lag measured by this cycle, if it consumed the pending write.
    pub lag: Option<Duration>,
}

impl ProbeResult {
    /// Returns `true` if at least one ingest target accepted the sample.
    pub fn write_succeeded(&self) -> bool {
        self.writes.iter().any(std::result::Result::is_ok)
    }

    /// Returns `true` if at least one query target matched.
    pub fn query_succeeded(&self) -> bool {
        self.queries.iter().any(|q| q.result.is_ok())
    }
}

/// The cycle driver for one series loop.
#[derive(Clone)]
pub struct ProbeCycle {
    context: Arc<ProbeContext>,
    slot: usize,
    ingest: Vec<Arc<dyn IngestTarget>>,
}

impl fmt::Debug for ProbeCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ingest: Vec<_> = self.ingest.iter().map(|t| t.target()).collect();
        f.debug_struct("ProbeCycle")
            .field("canary", &self.context.canary)
            .field("slot", &self.slot)
            .field("ingest", &ingest)
            .finish()
    }
}

impl ProbeCycle {
    /// Creates the cycle for series slot `slot`, writing to `ingest`.
    ///
    /// Slots must be distinct within a canary: pending writes are tracked
    /// per slot.
    pub fn new(context: Arc<ProbeContext>, slot: usize, ingest: Vec<Arc<dyn IngestTarget>>) -> Self {
        Self {
            context,
            slot,
            ingest,
        }
    }

    /// The series slot index within the canary.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The shared canary state.
    pub fn context(&self) -> &Arc<ProbeContext> {
        &self.context
    }

    /// Runs one full cycle.
    ///
    /// Never fails: every error is logged, counted and reported in the
    /// result. Dropping the returned future abandons the cycle at its current
    /// suspension point.
    pub async fn run_cycle(&self) -> ProbeResult {
        let request_id = self.context.allocator.allocate();
        let span = tracing::debug_span!(
            "probe_cycle",
            canary = %self.context.canary,
            slot = self.slot,
            request_id = %request_id,
        );
        self.cycle(request_id).instrument(span).await
    }

    async fn cycle(&self, request_id: String) -> ProbeResult {
        let ctx = &self.context;
        let settings = ctx.settings;

        let mut result = ProbeResult {
            request_id,
            last_state: CycleState::Writing,
            writes: Vec::with_capacity(self.ingest.len()),
            queries: Vec::with_capacity(ctx.query.len()),
            lag: None,
        };
        let request_id = result.request_id.clone();

        transition(CycleState::Writing);
        let written_at = Instant::now();
        ctx.timestamps.insert(self.slot, &request_id, written_at);

        match timeout(settings.write_timeout, self.write_all(&request_id)).await {
            Ok(writes) => result.writes = writes,
            Err(_) => {
                ctx.timestamps.remove_if(self.slot, &request_id, written_at);
                let err = WriteError::Timeout {
                    timeout: settings.write_timeout,
                };
                ctx.metrics.record_write_error(err.reason());
                tracing::warn!(error = %err, "write step abandoned");
                result.writes.push(Err(err));
                transition(CycleState::Idle);
                return result;
            }
        }

        if !result.write_succeeded() {
            ctx.timestamps.remove_if(self.slot, &request_id, written_at);
            tracing::warn!("no ingest target accepted the sample, skipping query");
            transition(CycleState::Idle);
            return result;
        }

        result.last_state = CycleState::Settling;
        transition(CycleState::Settling);
        tokio::time::sleep(settings.write_timeout).await;

        result.last_state = CycleState::Querying;
        transition(CycleState::Querying);
        for target in &ctx.query {
            let attempt = self.query_one(target.as_ref(), &request_id).await;
            if attempt.result.is_ok() && result.lag.is_none() {
                result.last_state = CycleState::Recording;
                transition(CycleState::Recording);
                result.lag = ctx.record_match(self.slot, &request_id);
            }
            result.queries.push(attempt);
        }

        transition(CycleState::Idle);
        result
    }

    async fn write_all(&self, request_id: &str) -> Vec<std::result::Result<(), WriteError>> {
        let metrics = &self.context.metrics;
        let mut writes = Vec::with_capacity(self.ingest.len());

        for target in &self.ingest {
            match target.write(request_id).await {
                Ok(()) => {
                    metrics.record_write();
                    tracing::debug!(endpoint = target.target(), "sample written");
                    writes.push(Ok(()));
                }
                Err(source) => {
                    let err = WriteError::Target {
                        target: target.target().to_string(),
                        source,
                    };
                    metrics.record_write_error(err.reason());
                    tracing::warn!(error = %err, "write failed");
                    writes.push(Err(err));
                }
            }
        }

        writes
    }

    async fn query_one(&self, target: &dyn QueryTarget, request_id: &str) -> QueryAttempt {
        let ctx = &self.context;
        let query_timeout = ctx.settings.query_timeout;

        ctx.metrics.record_query_attempt();
        let started = Instant::now();

        let result = match timeout(query_timeout, target.query(request_id)).await {
            Err(_) => Err(QueryError::Timeout {
                target: target.target().to_string(),
                timeout: query_timeout,
            }),
            Ok(Err(source)) => Err(QueryError::Transport {
                target: target.target().to_string(),
                source,
            }),
            Ok(Ok(matched)) if matched.is_empty() => Err(QueryError::EmptyResult {
                target: target.target().to_string(),
                query: canary_query(request_id),
            }),
            Ok(Ok(_)) => Ok(()),
        };
        let duration = started.elapsed();

        match &result {
            Ok(()) => {
                ctx.metrics.record_query_success(duration);
                tracing::debug!(
                    endpoint = target.target(),
                    duration = ?duration,
                    "query matched"
                );
            }
            Err(err) => {
                ctx.metrics.record_query_error(err.reason());
                tracing::warn!(error = %err, reason = err.reason(), "query failed");
            }
        }

        QueryAttempt {
            target: target.target().to_string(),
            duration,
            result,
        }
    }
}

fn transition(state: CycleState) {
    tracing::trace!(state = %state, "cycle state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::target::testing::{FakeBackend, FakeIngest, FakeQuery, QueryMode};

    fn settings(write_ms: u64, query_ms: u64) -> ProbeSettings {
        ProbeSettings {
            write_timeout: Duration::from_millis(write_ms),
            query_timeout: Duration::from_millis(query_ms),
        }
    }

    fn context(
        settings: ProbeSettings,
        max_active_series: usize,
        query: Vec<Arc<FakeQuery>>,
    ) -> Arc<ProbeContext> {
        let registry = MetricsRegistry::new().unwrap();
        let query = query
            .into_iter()
            .map(|q| q as Arc<dyn QueryTarget>)
            .collect();
        Arc::new(ProbeContext::new(
            "test",
            settings,
            max_active_series,
            query,
            registry.for_canary("test"),
        ))
    }

    fn cycle_for(ctx: &Arc<ProbeContext>, ingest: Vec<FakeIngest>) -> ProbeCycle {
        let ingest = ingest
            .into_iter()
            .map(|i| Arc::new(i) as Arc<dyn IngestTarget>)
            .collect();
        ProbeCycle::new(Arc::clone(ctx), 0, ingest)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_measured_from_write() {
        let backend = FakeBackend::new();
        let query = Arc::new(
            FakeQuery::new("q", &backend, QueryMode::Backend).with_delay(Duration::from_secs(1)),
        );
        let ctx = context(settings(1_000, 5_000), 2, vec![query.clone()]);
        let cycle = cycle_for(&ctx, vec![FakeIngest::new("i", &backend)]);

        let result = cycle.run_cycle().await;

        // 1s settle + 1s query
        assert_eq!(result.lag, Some(Duration::from_secs(2)));
        assert_eq!(result.last_state, CycleState::Recording);
        assert!(result.write_succeeded());
        assert!(result.query_succeeded());
        assert_eq!(result.queries[0].duration, Duration::from_secs(1));
        assert!(ctx.timestamps().get(0, &result.request_id).is_none());

        let snap = ctx.metrics().snapshot();
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.queries, 1);
        assert_eq!(snap.query_successes, 1);
        assert_eq!(snap.lag_count, 1);
        assert!((snap.lag_sum_seconds - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_result_counts_once_without_lag() {
        let backend = FakeBackend::new();
        let query = Arc::new(FakeQuery::new("q", &backend, QueryMode::Empty));
        let ctx = context(settings(100, 1_000), 1, vec![query]);
        let cycle = cycle_for(&ctx, vec![FakeIngest::new("i", &backend)]);

        let result = cycle.run_cycle().await;

        assert!(result.lag.is_none());
        assert!(matches!(
            result.queries[0].result,
            Err(QueryError::EmptyResult { .. })
        ));
        let snap = ctx.metrics().snapshot();
        assert_eq!(snap.queries, 1);
        assert_eq!(snap.query_errors_empty, 1);
        assert_eq!(snap.query_errors(), 1);
        assert_eq!(snap.query_durations, 0);
        assert_eq!(snap.lag_count, 0);
        // The write stays pending for a later cycle of the same ID
        assert!(ctx.timestamps().get(0, &result.request_id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_aborts_at_deadline() {
        let backend = FakeBackend::new();
        let query = Arc::new(FakeQuery::new("q", &backend, QueryMode::Backend));
        let ctx = context(settings(1_000, 1_000), 1, vec![query.clone()]);
        let ingest = FakeIngest::new("slow", &backend).with_first_delay(Duration::from_secs(5));
        let cycle = cycle_for(&ctx, vec![ingest]);

        let started = Instant::now();
        let result = cycle.run_cycle().await;

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(result.last_state, CycleState::Writing);
        assert!(matches!(result.writes[..], [Err(WriteError::Timeout { .. })]));
        assert!(result.queries.is_empty());
        assert_eq!(query.call_count(), 0);
        assert!(ctx.timestamps().is_empty());
        assert_eq!(ctx.metrics().snapshot().write_errors_timeout, 1);

        // The next tick runs normally
        let result = cycle.run_cycle().await;
        assert!(result.write_succeeded());
        assert_eq!(result.lag, Some(Duration::from_secs(1)));
        assert_eq!(ctx.metrics().snapshot().write_errors_timeout, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout_reported_at_deadline() {
        let backend = FakeBackend::new();
        let query = Arc::new(
            FakeQuery::new("q", &backend, QueryMode::Backend).with_delay(Duration::from_secs(30)),
        );
        let ctx = context(settings(100, 2_000), 1, vec![query]);
        let cycle = cycle_for(&ctx, vec![FakeIngest::new("i", &backend)]);

        let result = cycle.run_cycle().await;

        let attempt = &result.queries[0];
        assert!(matches!(attempt.result, Err(QueryError::Timeout { .. })));
        assert_eq!(attempt.duration, Duration::from_secs(2));
        assert_eq!(ctx.metrics().snapshot().query_errors_timeout, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_query_target_does_not_stop_others() {
        let backend = FakeBackend::new();
        let broken = Arc::new(FakeQuery::new("broken", &backend, QueryMode::Error));
        let healthy = Arc::new(FakeQuery::new("healthy", &backend, QueryMode::Backend));
        let ctx = context(settings(100, 1_000), 1, vec![broken, healthy.clone()]);
        let cycle = cycle_for(&ctx, vec![FakeIngest::new("i", &backend)]);

        let result = cycle.run_cycle().await;

        assert_eq!(result.queries.len(), 2);
        assert!(matches!(
            result.queries[0].result,
            Err(QueryError::Transport { .. })
        ));
        assert!(result.queries[1].result.is_ok());
        assert_eq!(healthy.call_count(), 1);
        assert!(result.lag.is_some());

        let snap = ctx.metrics().snapshot();
        assert_eq!(snap.queries, 2);
        assert_eq!(snap.query_errors_transport, 1);
        assert_eq!(snap.query_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_recorded_once_per_write() {
        let backend = FakeBackend::new();
        let first = Arc::new(FakeQuery::new("a", &backend, QueryMode::Backend));
        let second = Arc::new(FakeQuery::new("b", &backend, QueryMode::Backend));
        let ctx = context(settings(100, 1_000), 1, vec![first, second]);
        let cycle = cycle_for(&ctx, vec![FakeIngest::new("i", &backend)]);

        let result = cycle.run_cycle().await;

        assert!(result.queries.iter().all(|q| q.result.is_ok()));
        let snap = ctx.metrics().snapshot();
        assert_eq!(snap.query_successes, 2);
        assert_eq!(snap.lag_count, 1);

        // A late match for a consumed ID is a no-op
        assert!(ctx.record_match(0, &result.request_id).is_none());
        assert_eq!(ctx.metrics().snapshot().lag_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_writes_failed_skips_query() {
        let backend = FakeBackend::new();
        let query = Arc::new(FakeQuery::new("q", &backend, QueryMode::Backend));
        let ctx = context(settings(100, 1_000), 1, vec![query.clone()]);
        let cycle = cycle_for(&ctx, vec![FakeIngest::new("down", &backend).failing()]);

        let result = cycle.run_cycle().await;

        assert!(!result.write_succeeded());
        assert!(matches!(result.writes[..], [Err(WriteError::Target { .. })]));
        assert_eq!(query.call_count(), 0);
        assert!(ctx.timestamps().is_empty());
        assert_eq!(ctx.metrics().snapshot().write_errors_target, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_write_failure_still_queries() {
        let backend = FakeBackend::new();
        let query = Arc::new(FakeQuery::new("q", &backend, QueryMode::Backend));
        let ctx = context(settings(100, 1_000), 1, vec![query.clone()]);
        let cycle = cycle_for(
            &ctx,
            vec![
                FakeIngest::new("down", &backend).failing(),
                FakeIngest::new("up", &backend),
            ],
        );

        let result = cycle.run_cycle().await;

        assert_eq!(result.writes.len(), 2);
        assert!(result.write_succeeded());
        assert_eq!(query.call_count(), 1);
        assert!(result.lag.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_sharing_an_id_measure_their_own_lag() {
        let backend = FakeBackend::new();
        let query = Arc::new(FakeQuery::new("q", &backend, QueryMode::Backend));
        let ctx = context(settings(4_000, 1_000), 1, vec![query]);
        let first = ProbeCycle::new(
            Arc::clone(&ctx),
            0,
            vec![Arc::new(FakeIngest::new("a", &backend)) as Arc<dyn IngestTarget>],
        );
        let second = ProbeCycle::new(
            Arc::clone(&ctx),
            1,
            vec![Arc::new(FakeIngest::new("b", &backend)) as Arc<dyn IngestTarget>],
        );

        // The second slot rewrites the same ID while the first is settling
        let (a, b) = tokio::join!(first.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            second.run_cycle().await
        });

        assert_eq!(a.request_id, b.request_id);
        assert_eq!(a.lag, Some(Duration::from_secs(4)));
        assert_eq!(b.lag, Some(Duration::from_secs(4)));
        assert!(ctx.timestamps().is_empty());
        assert_eq!(ctx.metrics().snapshot().lag_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_rotate_through_pool() {
        let backend = FakeBackend::new();
        let query = Arc::new(FakeQuery::new("q", &backend, QueryMode::Backend));
        let ctx = context(settings(10, 100), 2, vec![query]);
        let cycle = cycle_for(&ctx, vec![FakeIngest::new("i", &backend)]);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(cycle.run_cycle().await.request_id);
        }

        assert_eq!(ctx.allocator().len(), 2);
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);
        assert_eq!(seen[0], seen[4]);
        assert_ne!(seen[0], seen[1]);
        assert_eq!(backend.writes(), seen);
    }
}
