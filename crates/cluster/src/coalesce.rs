//! Coalesced one-shot actions keyed by cause
//!
//! When many concurrent operations hit errors pointing at the same stale
//! topology, each of them wants a rediscovery. Running one per caller
//! would stampede the discovery source; instead, the first caller for a
//! cause schedules one delayed attempt and everyone else arriving before
//! it finishes waits on that same attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Runs at most one in-flight action per cause key
#[derive(Clone)]
pub struct Coalescer {
    delay: Duration,
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>,
}

impl Coalescer {
    /// Actions start `delay` after the first caller requests them
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight action for `cause`, or schedule a new one, and
    /// wait for it to finish
    pub async fn run<F, Fut>(&self, cause: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut rx = {
            let mut inflight = self.inflight.lock();
            if let Some(rx) = inflight.get(cause) {
                debug!(cause, "joining in-flight coalesced action");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(false);
                inflight.insert(cause.to_string(), rx.clone());

                let delay = self.delay;
                let cause = cause.to_string();
                let inflight = self.inflight.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    action().await;
                    inflight.lock().remove(&cause);
                    let _ = tx.send(true);
                });
                rx
            }
        };

        // The sender flips to true before dropping, so a closed channel
        // still carries the completion value
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrent_callers_share_one_action() {
        let coalescer = Arc::new(Coalescer::new(Duration::from_millis(20)));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coalescer = coalescer.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("cluster", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_causes_run_independently() {
        let coalescer = Arc::new(Coalescer::new(Duration::from_millis(1)));
        let runs = Arc::new(AtomicUsize::new(0));

        for cause in ["island-1", "island-2"] {
            let runs = runs.clone();
            coalescer
                .run(cause, move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_next_request_after_completion_runs_again() {
        let coalescer = Coalescer::new(Duration::from_millis(1));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let runs = runs.clone();
            coalescer
                .run("cluster", move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
