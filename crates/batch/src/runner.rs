//! Per-operation execution contract
//!
//! The batcher is generic machinery; a `Runner` supplied per operation
//! kind knows how to derive dedup keys, how to turn a batch of inputs
//! into one physical call, and how to classify physical errors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sg_core::QueryError;

/// What to do with one item after its individual execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Deliver the error as is
    NoRetry,
    /// Retry once right away
    Immediate,
    /// Retry once after a delay
    After(Duration),
}

/// Execution strategy for one kind of logical operation
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    /// Input of one logical request
    type Input: Clone + Send + Sync + 'static;
    /// Result delivered to every caller sharing a key
    type Output: Clone + Send + Sync + 'static;

    /// Operation name for logs
    fn name(&self) -> &str;

    /// Dedup key for an input
    ///
    /// Callers submitting inputs with the same key within one flush
    /// window are coalesced onto one execution. `None` means this input
    /// must never be merged with anything; each call gets a unique key.
    /// That is the default, and the right choice for inserts.
    fn key(&self, _input: &Self::Input) -> Option<String> {
        None
    }

    /// Entries per physical batch before an immediate flush
    fn max_batch_size(&self) -> usize {
        100
    }

    /// Whether `run_batch` is implemented
    fn supports_batching(&self) -> bool {
        false
    }

    /// Output for a key the batch response omitted without an error
    fn default_output(&self) -> Self::Output;

    /// Execute one input
    async fn run_single(&self, input: Self::Input) -> Result<Self::Output, QueryError>;

    /// Execute a whole batch as one physical call, outputs keyed like the
    /// inputs
    async fn run_batch(
        &self,
        inputs: &HashMap<String, Self::Input>,
    ) -> Result<HashMap<String, Self::Output>, QueryError> {
        let _ = inputs;
        Err(QueryError::fail("batch execution not supported"))
    }

    /// Retry decision after one item's individual execution failed
    fn retry_delay_on_single_error(&self, _error: &QueryError) -> RetryDecision {
        RetryDecision::NoRetry
    }

    /// Whether a failed batch should be split and re-run item by item
    ///
    /// True for errors that only concern some rows (deadlocks, constraint
    /// violations), so unrelated callers are not penalized by one bad
    /// input.
    fn should_debatch_on_error(&self, _error: &QueryError) -> bool {
        false
    }
}
