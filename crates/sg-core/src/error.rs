//! Error taxonomy for the routing layer
//!
//! Two families:
//! - `QueryError`: a classified failure from the physical executor, carrying
//!   a suggested recovery action and a write-safety kind
//! - `ClusterError`: failures raised by the routing layer itself (topology
//!   lookups, retries exhausted, destroyed instances)

use std::fmt;
use std::sync::Arc;

use crate::shard::{IslandNo, ShardNo};

/// Recovery action suggested by the connection layer for a failed operation
///
/// The routing layer applies the suggested action; callers never choose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    /// The whole topology may be stale; rediscover every island
    RediscoverCluster,
    /// Only this island's member roles may be stale
    RediscoverIsland,
    /// The node is bad but the topology is fine; retry on another connection
    ChooseAnotherClient,
    /// Not recoverable by retrying
    Fail,
}

/// Whether the server may have applied the statement despite the failure
///
/// Matters for write safety: retrying after `UnknownServerState` risks
/// double-applying a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server is known not to have changed any data
    DataOnServerIsUnchanged,
    /// The server may or may not have applied the statement
    UnknownServerState,
}

/// A classified error returned by the physical executor
///
/// Cloneable so one failure can be fanned out to every caller coalesced
/// into the same batch; the underlying cause is shared, not duplicated.
#[derive(Debug, Clone)]
pub struct QueryError {
    /// Suggested recovery action
    pub post_action: PostAction,
    /// Write-safety classification
    pub kind: ErrorKind,
    /// Human-readable description
    pub comment: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl QueryError {
    /// Create a classified error with no underlying cause
    pub fn new(post_action: PostAction, kind: ErrorKind, comment: impl Into<String>) -> Self {
        Self {
            post_action,
            kind,
            comment: comment.into(),
            source: None,
        }
    }

    /// Attach the underlying cause, preserving the causal chain
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Shorthand for a non-retryable error that left server data unchanged
    pub fn fail(comment: impl Into<String>) -> Self {
        Self::new(PostAction::Fail, ErrorKind::DataOnServerIsUnchanged, comment)
    }

    /// True when retrying cannot double-apply a write
    pub fn is_retry_safe(&self) -> bool {
        self.kind == ErrorKind::DataOnServerIsUnchanged
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.comment)
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Errors raised by the routing layer itself
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// The cached topology has no island for this shard. Fatal and never
    /// retried: an invalid shard number must not be able to trigger
    /// rediscovery traffic.
    #[error("shard {0} is not discoverable")]
    ShardNotDiscoverable(ShardNo),

    /// The requested island is not in the current topology
    #[error("island {0} is not in the current topology")]
    IslandNotFound(IslandNo),

    /// Discovery found the same shard on two islands. Indicates a
    /// misconfigured cluster, not a transient condition.
    #[error("shard {shard} is claimed by island {first} and island {second}")]
    ShardClaimedTwice {
        shard: ShardNo,
        first: IslandNo,
        second: IslandNo,
    },

    /// The instance was destroyed while callers were still waiting
    #[error("destroyed")]
    Destroyed,

    /// Discovery failed before any snapshot existed
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Retries were exhausted; carries the most recent classified error
    #[error("gave up after {attempts} attempts")]
    AttemptsExhausted {
        attempts: usize,
        #[source]
        last: QueryError,
    },

    /// A classified executor error that propagated without retry
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ClusterError {
    /// True for errors that indicate misuse or misconfiguration rather
    /// than a transient cluster condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::ShardNotDiscoverable(_)
                | ClusterError::ShardClaimedTwice { .. }
                | ClusterError::Destroyed
        )
    }
}
