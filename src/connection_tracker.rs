//! Per-channel in-flight request counter with a process-wide soft max.
//!
//! The tracker is a hint consumed by `ConnectionAwareStrategy`, not a
//! gate: transient over-counts under concurrent increments/decrements
//! are acceptable (see the design doc's concurrency section).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ChannelCounter {
    active: AtomicI64,
}

/// Tracks active upstream requests per channel plus a single
/// process-wide soft maximum (0 means "no limit").
#[derive(Debug)]
pub struct ConnectionTracker {
    counters: RwLock<HashMap<String, ChannelCounter>>,
    max: i64,
}

impl ConnectionTracker {
    pub fn new(max: i64) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            max: max.max(0),
        }
    }

    pub fn increment(&self, channel_id: &str) {
        if let Some(counter) = self.counters.read().get(channel_id) {
            counter.active.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let mut counters = self.counters.write();
        let counter = counters.entry(channel_id.to_string()).or_default();
        counter.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the counter, clamped at zero.
    pub fn decrement(&self, channel_id: &str) {
        if let Some(counter) = self.counters.read().get(channel_id) {
            let prev = counter.active.fetch_sub(1, Ordering::SeqCst);
            if prev <= 0 {
                // Clamp: undo the over-decrement.
                counter.active.fetch_add(1, Ordering::SeqCst);
            }
            return;
        }
        tracing::debug!(channel_id, "decrement on untracked channel, ignoring");
    }

    pub fn active(&self, channel_id: &str) -> i64 {
        self.counters
            .read()
            .get(channel_id)
            .map(|c| c.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Returns the process-wide soft max. 0 means "no limit".
    pub fn max(&self, _channel_id: &str) -> i64 {
        self.max
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

/// RAII guard that decrements exactly once, even across multiple
/// possible completion paths (success, error, stream close). A guarded
/// boolean prevents double-decrement, matching the invariant in the
/// design doc.
pub struct ConnectionGuard<'a> {
    tracker: &'a ConnectionTracker,
    channel_id: String,
    released: bool,
}

impl<'a> ConnectionGuard<'a> {
    pub fn acquire(tracker: &'a ConnectionTracker, channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        tracker.increment(&channel_id);
        Self {
            tracker,
            channel_id,
            released: false,
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.tracker.decrement(&self.channel_id);
            self.released = true;
        }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Same release-at-most-once contract as `ConnectionGuard`, but owns its
/// `Arc<ConnectionTracker>` instead of borrowing one. Needed by detached
/// stream-persistence tasks spawned with `tokio::spawn`, which must be
/// `'static` and so cannot hold a borrow tied to the request call stack.
pub struct OwnedConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    channel_id: String,
    released: bool,
}

impl OwnedConnectionGuard {
    pub fn acquire(tracker: Arc<ConnectionTracker>, channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        tracker.increment(&channel_id);
        Self {
            tracker,
            channel_id,
            released: false,
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.tracker.decrement(&self.channel_id);
            self.released = true;
        }
    }
}

impl Drop for OwnedConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_decrement_round_trips() {
        let tracker = ConnectionTracker::new(10);
        tracker.increment("ch1");
        tracker.increment("ch1");
        assert_eq!(tracker.active("ch1"), 2);
        tracker.decrement("ch1");
        assert_eq!(tracker.active("ch1"), 1);
        tracker.decrement("ch1");
        assert_eq!(tracker.active("ch1"), 0);
    }

    #[test]
    fn decrement_below_zero_clamps() {
        let tracker = ConnectionTracker::new(10);
        tracker.decrement("ch1");
        assert_eq!(tracker.active("ch1"), 0);
    }

    #[test]
    fn unknown_channel_has_zero_active() {
        let tracker = ConnectionTracker::new(10);
        assert_eq!(tracker.active("missing"), 0);
    }

    #[test]
    fn max_is_process_wide() {
        let tracker = ConnectionTracker::new(42);
        assert_eq!(tracker.max("any-channel"), 42);
    }

    #[test]
    fn guard_decrements_on_drop() {
        let tracker = ConnectionTracker::new(10);
        {
            let _guard = ConnectionGuard::acquire(&tracker, "ch1");
            assert_eq!(tracker.active("ch1"), 1);
        }
        assert_eq!(tracker.active("ch1"), 0);
    }

    #[test]
    fn guard_decrements_at_most_once() {
        let tracker = ConnectionTracker::new(10);
        let mut guard = ConnectionGuard::acquire(&tracker, "ch1");
        guard.release();
        guard.release();
        assert_eq!(tracker.active("ch1"), 0);
        drop(guard);
        assert_eq!(tracker.active("ch1"), 0);
    }

    #[test]
    fn owned_guard_decrements_on_drop() {
        let tracker = Arc::new(ConnectionTracker::new(10));
        {
            let _guard = OwnedConnectionGuard::acquire(tracker.clone(), "ch1");
            assert_eq!(tracker.active("ch1"), 1);
        }
        assert_eq!(tracker.active("ch1"), 0);
    }

    #[test]
    fn counters_are_independent_per_channel() {
        let tracker = ConnectionTracker::new(10);
        tracker.increment("ch1");
        tracker.increment("ch2");
        tracker.decrement("ch1");
        assert_eq!(tracker.active("ch1"), 0);
        assert_eq!(tracker.active("ch2"), 1);
    }
}
