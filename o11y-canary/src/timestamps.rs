//! Pending-write bookkeeping for lag measurement.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Map from (series slot, request ID) to the instant that slot's write was
/// issued.
///
/// Slots of one canary draw from a shared ID pool, so several slots can hold
/// the same request ID at once. Each slot records and consumes only its own
/// entry. Entries are consumed by [`take_elapsed`](Self::take_elapsed); a
/// second success for the same write finds nothing and records nothing.
#[derive(Debug, Default)]
pub struct InsertionTimestamps {
    inner: Mutex<HashMap<(usize, String), Instant>>,
}

impl InsertionTimestamps {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `at` as the write instant for `request_id` in `slot`,
    /// replacing any earlier write of the same (rotated) ID by that slot.
    pub fn insert(&self, slot: usize, request_id: &str, at: Instant) {
        self.lock().insert((slot, request_id.to_string()), at);
    }

    /// Returns the pending write instant for `request_id` in `slot`, if any.
    pub fn get(&self, slot: usize, request_id: &str) -> Option<Instant> {
        self.lock().get(&(slot, request_id.to_string())).copied()
    }

    /// Removes the entry for `request_id` in `slot`, returning it.
    pub fn remove(&self, slot: usize, request_id: &str) -> Option<Instant> {
        self.lock().remove(&(slot, request_id.to_string()))
    }

    /// Removes the entry only if it still holds `at`.
    ///
    /// Used to withdraw a failed write without clobbering a newer write.
    pub fn remove_if(&self, slot: usize, request_id: &str, at: Instant) -> bool {
        let key = (slot, request_id.to_string());
        let mut map = self.lock();
        if map.get(&key) == Some(&at) {
            map.remove(&key);
            true
        } else {
            false
        }
    }

    /// Consumes the entry for `request_id` in `slot` and returns
    /// `now - written_at`.
    ///
    /// Returns `None` if there is no pending write.
    pub fn take_elapsed(&self, slot: usize, request_id: &str, now: Instant) -> Option<Duration> {
        self.lock()
            .remove(&(slot, request_id.to_string()))
            .map(|written_at| now.saturating_duration_since(written_at))
    }

    /// Number of pending writes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no write is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(usize, String), Instant>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_elapsed_consumes_entry() {
        let timestamps = InsertionTimestamps::new();
        let t0 = Instant::now();
        timestamps.insert(0, "abc", t0);

        let lag = timestamps.take_elapsed(0, "abc", t0 + Duration::from_secs(2));
        assert_eq!(lag, Some(Duration::from_secs(2)));
        assert!(timestamps.get(0, "abc").is_none());

        // Replay of a consumed ID is a no-op
        assert_eq!(timestamps.take_elapsed(0, "abc", t0 + Duration::from_secs(3)), None);
    }

    #[test]
    fn test_elapsed_never_negative() {
        let timestamps = InsertionTimestamps::new();
        let t0 = Instant::now();
        timestamps.insert(0, "abc", t0 + Duration::from_secs(5));

        assert_eq!(timestamps.take_elapsed(0, "abc", t0), Some(Duration::ZERO));
    }

    #[test]
    fn test_rewrite_replaces_instant() {
        let timestamps = InsertionTimestamps::new();
        let t0 = Instant::now();
        timestamps.insert(0, "abc", t0);
        timestamps.insert(0, "abc", t0 + Duration::from_secs(1));

        assert_eq!(timestamps.len(), 1);
        assert_eq!(timestamps.get(0, "abc"), Some(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_slots_sharing_an_id_stay_separate() {
        let timestamps = InsertionTimestamps::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(2_500);
        timestamps.insert(0, "abc", t0);
        timestamps.insert(1, "abc", t1);
        assert_eq!(timestamps.len(), 2);

        let now = t0 + Duration::from_secs(4);
        assert_eq!(timestamps.take_elapsed(0, "abc", now), Some(Duration::from_secs(4)));
        assert_eq!(timestamps.get(1, "abc"), Some(t1));

        let later = t1 + Duration::from_secs(4);
        assert_eq!(timestamps.take_elapsed(1, "abc", later), Some(Duration::from_secs(4)));
        assert!(timestamps.is_empty());
    }

    #[test]
    fn test_remove_if_only_matches_same_write() {
        let timestamps = InsertionTimestamps::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        timestamps.insert(0, "abc", t1);

        assert!(!timestamps.remove_if(0, "abc", t0));
        assert_eq!(timestamps.get(0, "abc"), Some(t1));
        assert!(!timestamps.remove_if(1, "abc", t1));

        assert!(timestamps.remove_if(0, "abc", t1));
        assert!(timestamps.is_empty());
    }
}
