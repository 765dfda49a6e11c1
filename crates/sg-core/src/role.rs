//! Observed connection roles and health
//!
//! Roles are self-reported by the server after every executed operation.
//! Cluster failover can change which node is master without this layer
//! being told in advance, so role is observed state, not configuration.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Role a connection's server most recently self-reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Write-capable primary
    Master,
    /// Read-only replica
    Replica,
    /// Not yet determined (no operation executed since connect)
    Unknown,
}

/// A connectivity problem observed on a connection
///
/// Set when a connection attempt or query indicates the node is
/// unreachable; cleared by the next successful operation.
#[derive(Debug, Clone)]
pub struct ConnectionIssue {
    /// When the issue was first observed
    pub since: Instant,
    /// Human-readable cause for diagnostics
    pub comment: String,
}

impl ConnectionIssue {
    /// Record an issue starting now
    pub fn new(comment: impl Into<String>) -> Self {
        Self {
            since: Instant::now(),
            comment: comment.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_equality() {
        assert_eq!(Role::Master, Role::Master);
        assert_ne!(Role::Master, Role::Replica);
        assert_ne!(Role::Replica, Role::Unknown);
    }
}
