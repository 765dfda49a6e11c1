//! Coalescing and fan-out engine
//!
//! Sits between logical requests and the physical executor. Concurrent
//! requests arriving within one flush window are merged into a pending
//! batch keyed by the runner's dedup key; the batch flushes when it is
//! full or at the next scheduling-loop turn after its first item, so
//! naturally-concurrent callers coalesce without anyone waiting an extra
//! round trip. Every caller gets its own result delivery regardless of
//! how many shared a key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sg_core::QueryError;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::runner::{RetryDecision, Runner};

type ResultSender<R> =
    oneshot::Sender<Result<<R as Runner>::Output, QueryError>>;

struct Pending<R: Runner> {
    /// key → latest input; last writer wins within one flush window
    inputs: HashMap<String, R::Input>,
    /// key → callers waiting for that key's result
    waiters: HashMap<String, Vec<ResultSender<R>>>,
    /// Caller provenance for logging
    annotations: Vec<String>,
    /// Whether a next-turn flush is already scheduled
    scheduled: bool,
}

impl<R: Runner> Default for Pending<R> {
    fn default() -> Self {
        Self {
            inputs: HashMap::new(),
            waiters: HashMap::new(),
            annotations: Vec::new(),
            scheduled: false,
        }
    }
}

struct BatcherInner<R: Runner> {
    runner: Arc<R>,
    pending: Mutex<Pending<R>>,
    /// Source of unique keys for never-deduplicated inputs
    seq: AtomicU64,
}

/// Deduplicates and batches concurrent logical requests
///
/// Cheap to clone; clones share the same pending batch.
pub struct Batcher<R: Runner> {
    inner: Arc<BatcherInner<R>>,
}

impl<R: Runner> Clone for Batcher<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Runner> Batcher<R> {
    /// Wrap a runner
    pub fn new(runner: R) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                runner: Arc::new(runner),
                pending: Mutex::new(Pending::default()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Submit one logical request and wait for its result
    ///
    /// `annotation` names the caller for logs. Requests sharing a dedup
    /// key within one flush window all receive the same result or the
    /// same error.
    pub async fn run(
        &self,
        input: R::Input,
        annotation: impl Into<String>,
    ) -> Result<R::Output, QueryError> {
        let (tx, rx) = oneshot::channel();

        let flush_now = {
            let mut pending = self.inner.pending.lock();
            let key = self.inner.runner.key(&input).unwrap_or_else(|| {
                format!("#{}", self.inner.seq.fetch_add(1, Ordering::Relaxed))
            });
            pending.inputs.insert(key.clone(), input);
            pending.waiters.entry(key).or_default().push(tx);
            pending.annotations.push(annotation.into());

            if pending.inputs.len() >= self.inner.runner.max_batch_size() {
                true
            } else {
                if !pending.scheduled {
                    pending.scheduled = true;
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        // One turn of the scheduler is the coalescing
                        // window: everything enqueued by concurrent tasks
                        // up to this point merges into this flush
                        tokio::task::yield_now().await;
                        flush(inner).await;
                    });
                }
                false
            }
        };

        // The flush always runs on its own task: a caller that stops
        // waiting must never cancel a physical batch other callers are
        // still waiting on
        if flush_now {
            tokio::spawn(flush(self.inner.clone()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(QueryError::fail("batcher dropped before delivering a result")),
        }
    }

    /// Number of entries waiting for the next flush
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().inputs.len()
    }
}

/// Take the pending batch and execute it
async fn flush<R: Runner>(inner: Arc<BatcherInner<R>>) {
    let batch = {
        let mut pending = inner.pending.lock();
        if pending.inputs.is_empty() {
            pending.scheduled = false;
            return;
        }
        std::mem::take(&mut *pending)
    };

    let callers: usize = batch.waiters.values().map(|w| w.len()).sum();
    debug!(
        runner = inner.runner.name(),
        keys = batch.inputs.len(),
        callers,
        "flushing batch"
    );
    trace!(runner = inner.runner.name(), annotations = ?batch.annotations, "batch provenance");

    let mut waiters = batch.waiters;

    // A single-entry batch, or a runner without batch support, skips the
    // batch machinery entirely
    if batch.inputs.len() == 1 || !inner.runner.supports_batching() {
        run_individually(&inner, batch.inputs, waiters);
        return;
    }

    match inner.runner.run_batch(&batch.inputs).await {
        Ok(mut outputs) => {
            for (key, senders) in waiters.drain() {
                let output = outputs
                    .remove(&key)
                    .unwrap_or_else(|| inner.runner.default_output());
                for sender in senders {
                    let _ = sender.send(Ok(output.clone()));
                }
            }
        }
        Err(err) if inner.runner.should_debatch_on_error(&err) => {
            debug!(
                runner = inner.runner.name(),
                keys = batch.inputs.len(),
                "debatching after batch error: {err}"
            );
            run_individually(&inner, batch.inputs, waiters);
        }
        Err(err) => {
            warn!(runner = inner.runner.name(), "batch failed: {err}");
            for senders in waiters.into_values() {
                for sender in senders {
                    let _ = sender.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Run every entry as its own physical call, each on its own task so one
/// slow item does not hold back the others
fn run_individually<R: Runner>(
    inner: &Arc<BatcherInner<R>>,
    inputs: HashMap<String, R::Input>,
    mut waiters: HashMap<String, Vec<ResultSender<R>>>,
) {
    for (key, input) in inputs {
        let senders = waiters.remove(&key).unwrap_or_default();
        let runner = inner.runner.clone();
        tokio::spawn(async move {
            let result = run_item(&*runner, input).await;
            for sender in senders {
                let _ = sender.send(result.clone());
            }
        });
    }
}

/// Execute one item, retrying at most once per the runner's decision
async fn run_item<R: Runner>(runner: &R, input: R::Input) -> Result<R::Output, QueryError> {
    match runner.run_single(input.clone()).await {
        Ok(output) => Ok(output),
        Err(err) => match runner.retry_delay_on_single_error(&err) {
            RetryDecision::NoRetry => Err(err),
            RetryDecision::Immediate => runner.run_single(input).await,
            RetryDecision::After(delay) => {
                trace!(delay_ms = delay.as_millis() as u64, "delaying single retry");
                tokio::time::sleep(delay).await;
                runner.run_single(input).await
            }
        },
    }
}
