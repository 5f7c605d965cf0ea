//! Seams between the probe engine and the wire.
//!
//! The engine only sees these traits; [`crate::remote_write::RemoteWriteClient`]
//! and [`crate::query::QueryClient`] are the production implementations.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::query::QueryMatch;

/// Destination that synthetic samples are pushed to.
#[async_trait]
pub trait IngestTarget: Send + Sync {
    /// Identifies the target in logs and in the `target` sample label.
    fn target(&self) -> &str;

    /// Pushes one sample tagged with `request_id`, unbuffered.
    async fn write(&self, request_id: &str) -> Result<(), TransportError>;

    /// Releases the underlying channel. Must be idempotent.
    fn release(&self);
}

/// Destination queried to confirm a pushed sample is visible.
#[async_trait]
pub trait QueryTarget: Send + Sync {
    /// Identifies the target in logs.
    fn target(&self) -> &str;

    /// Runs an instant query for the series tagged with `request_id`.
    ///
    /// An empty match is returned as `Ok` with zero series; the engine
    /// decides that it is a failure.
    async fn query(&self, request_id: &str) -> Result<QueryMatch, TransportError>;

    /// Releases the underlying channel. Must be idempotent.
    fn release(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory targets with scripted latency and failures.

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    /// Shared record of what the fakes saw, standing in for a backend.
    #[derive(Debug, Default)]
    pub(crate) struct FakeBackend {
        pub(crate) written: Mutex<Vec<String>>,
        visible: Mutex<HashSet<String>>,
    }

    impl FakeBackend {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn writes(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }
    }

    pub(crate) struct FakeIngest {
        pub(crate) name: String,
        pub(crate) backend: Arc<FakeBackend>,
        pub(crate) delay: Duration,
        pub(crate) first_delay: Mutex<Option<Duration>>,
        pub(crate) fail: bool,
        pub(crate) releases: AtomicUsize,
    }

    impl FakeIngest {
        pub(crate) fn new(name: &str, backend: &Arc<FakeBackend>) -> Self {
            Self {
                name: name.to_string(),
                backend: Arc::clone(backend),
                delay: Duration::ZERO,
                first_delay: Mutex::new(None),
                fail: false,
                releases: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Delays only the first write by `delay`.
        pub(crate) fn with_first_delay(self, delay: Duration) -> Self {
            *self.first_delay.lock().unwrap() = Some(delay);
            self
        }

        pub(crate) fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub(crate) fn release_count(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IngestTarget for FakeIngest {
        fn target(&self) -> &str {
            &self.name
        }

        async fn write(&self, request_id: &str) -> Result<(), TransportError> {
            let delay = self.first_delay.lock().unwrap().take().unwrap_or(self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(TransportError::HttpStatus {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.backend
                .written
                .lock()
                .unwrap()
                .push(request_id.to_string());
            self.backend
                .visible
                .lock()
                .unwrap()
                .insert(request_id.to_string());
            Ok(())
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Scripted behaviour of a [`FakeQuery`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum QueryMode {
        /// Matches whatever the backend has seen written.
        Backend,
        /// Always returns zero series.
        Empty,
        /// Always fails at the API level.
        Error,
    }

    pub(crate) struct FakeQuery {
        pub(crate) name: String,
        pub(crate) backend: Arc<FakeBackend>,
        pub(crate) delay: Duration,
        pub(crate) mode: QueryMode,
        pub(crate) calls: AtomicUsize,
        pub(crate) releases: AtomicUsize,
    }

    impl FakeQuery {
        pub(crate) fn new(name: &str, backend: &Arc<FakeBackend>, mode: QueryMode) -> Self {
            Self {
                name: name.to_string(),
                backend: Arc::clone(backend),
                delay: Duration::ZERO,
                mode,
                calls: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn release_count(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryTarget for FakeQuery {
        fn target(&self) -> &str {
            &self.name
        }

        async fn query(&self, request_id: &str) -> Result<QueryMatch, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.mode {
                QueryMode::Backend => {
                    let series = usize::from(self.backend.visible.lock().unwrap().contains(request_id));
                    Ok(QueryMatch {
                        series,
                        warnings: Vec::new(),
                    })
                }
                QueryMode::Empty => Ok(QueryMatch::default()),
                QueryMode::Error => Err(TransportError::Api {
                    error_type: "bad_data".to_string(),
                    message: "parse error".to_string(),
                }),
            }
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}
