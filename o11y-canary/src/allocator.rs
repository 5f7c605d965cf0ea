//! Bounded, rotating pool of request identifiers.
//!
//! Every synthetic sample carries a `request_id` label. Minting a fresh ID per
//! write would create an unbounded number of series at the backend, so the
//! allocator keeps at most `max_active_series` IDs alive: it mints new IDs
//! until the pool is full, then hands the oldest one back out and moves it to
//! the tail.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// FIFO pool of request IDs with a cardinality ceiling.
///
/// Shared between all series loops of one canary. `allocate` takes the lock
/// once, so minting and rotation are a single atomic step.
#[derive(Debug)]
pub struct SeriesIdAllocator {
    max_active_series: usize,
    pool: Mutex<VecDeque<String>>,
}

impl SeriesIdAllocator {
    /// Creates an empty allocator. A ceiling of zero is treated as one.
    pub fn new(max_active_series: usize) -> Self {
        let max_active_series = max_active_series.max(1);
        Self {
            max_active_series,
            pool: Mutex::new(VecDeque::with_capacity(max_active_series)),
        }
    }

    /// Returns the ID to use for the next write.
    ///
    /// While the pool is below the ceiling a new ID is minted and appended.
    /// Once full, the head of the pool is returned and moved to the tail.
    pub fn allocate(&self) -> String {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);

        if pool.len() >= self.max_active_series
            && let Some(id) = pool.pop_front()
        {
            pool.push_back(id.clone());
            return id;
        }

        let id = mint_request_id();
        pool.push_back(id.clone());
        id
    }

    /// Snapshot of the active IDs, oldest first.
    pub fn active(&self) -> Vec<String> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of IDs currently in rotation.
    pub fn len(&self) -> usize {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no ID has been allocated yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cardinality ceiling.
    pub fn capacity(&self) -> usize {
        self.max_active_series
    }
}

/// Mints a globally unique request ID: 32 lower-case hex characters.
fn mint_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
