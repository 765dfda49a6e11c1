//! Replication position tracking
//!
//! Every connection carries a tracker holding the last replication position
//! its server reported. The connection layer feeds the tracker after every
//! executed operation, so freshness checks ("has this replica caught up to
//! position X?") usually cost nothing. When the tracked value is older than
//! the refresh interval, exactly one fetch is issued and concurrent callers
//! coalesce onto it.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::QueryError;

#[derive(Debug, Default)]
struct TrackerState {
    pos: u64,
    changed_at: Option<Instant>,
}

/// Per-connection holder of the last-known replication position
///
/// The position is monotonically non-decreasing for the lifetime of a
/// connection; it is only lowered by `reset()` after a reconnect.
#[derive(Debug)]
pub struct PositionTracker {
    refresh_interval: Duration,
    state: Mutex<TrackerState>,
    // Serializes fetches so concurrent stale readers share one round trip
    refresh_gate: tokio::sync::Mutex<()>,
}

impl PositionTracker {
    /// Create a tracker that considers positions older than
    /// `refresh_interval` stale
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            state: Mutex::new(TrackerState::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Last known position without triggering a refresh
    pub fn pos(&self) -> u64 {
        self.state.lock().pos
    }

    /// Record a position reported by an executed operation
    ///
    /// Only raises the stored position; a lower report is stale information
    /// from an operation that was already in flight and is ignored.
    pub fn observe(&self, pos: u64) {
        let mut state = self.state.lock();
        if pos >= state.pos {
            state.pos = pos;
            state.changed_at = Some(Instant::now());
        }
    }

    /// Force-overwrite the position, used after a reconnect
    pub fn reset(&self, pos: u64) {
        let mut state = self.state.lock();
        state.pos = pos;
        state.changed_at = Some(Instant::now());
    }

    /// Current position, refreshing via `fetch` at most once per interval
    ///
    /// Returns the stored position directly when it was updated within the
    /// refresh interval. Otherwise issues one `fetch`; callers that arrive
    /// while a fetch is in flight wait for it instead of fetching again.
    pub async fn current<F, Fut>(&self, fetch: F) -> Result<u64, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, QueryError>>,
    {
        if let Some(pos) = self.fresh_pos() {
            return Ok(pos);
        }

        let _gate = self.refresh_gate.lock().await;
        // A coalesced caller may have refreshed while we waited for the gate
        if let Some(pos) = self.fresh_pos() {
            return Ok(pos);
        }

        let fetched = fetch().await?;
        trace!(pos = fetched, "replication position refreshed");
        self.observe(fetched);
        Ok(self.pos())
    }

    fn fresh_pos(&self) -> Option<u64> {
        let state = self.state.lock();
        match state.changed_at {
            Some(at) if at.elapsed() < self.refresh_interval => Some(state.pos),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_observe_is_monotonic() {
        let tracker = PositionTracker::new(Duration::from_millis(100));
        tracker.observe(10);
        tracker.observe(5);
        assert_eq!(tracker.pos(), 10);

        tracker.reset(5);
        assert_eq!(tracker.pos(), 5);
    }

    #[tokio::test]
    async fn test_second_call_within_interval_skips_fetch() {
        let tracker = PositionTracker::new(Duration::from_secs(60));
        let fetches = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let fetches = fetches.clone();
            let pos = tracker
                .current(|| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(pos, 42);
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let tracker = Arc::new(PositionTracker::new(Duration::from_secs(60)));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                tracker
                    .current(|| async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(7)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operation_feedback_avoids_fetch() {
        let tracker = PositionTracker::new(Duration::from_secs(60));
        let fetches = Arc::new(AtomicUsize::new(0));
        // Connection layer reports a position after an executed operation
        tracker.observe(99);

        let counted = fetches.clone();
        let pos = tracker
            .current(|| async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            })
            .await
            .unwrap();
        assert_eq!(pos, 99);
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }
}
