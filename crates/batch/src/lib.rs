//! Request coalescing and fan-out
//!
//! - `runner`: the per-operation execution contract
//! - `batcher`: the generic dedup/batch/fan-out engine

pub mod batcher;
pub mod runner;

pub use batcher::Batcher;
pub use runner::{RetryDecision, Runner};
