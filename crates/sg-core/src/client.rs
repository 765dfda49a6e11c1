//! Physical executor contract
//!
//! The routing layer never speaks a wire protocol itself. A backend
//! supplies a `Client` per node: a long-lived handle that executes
//! statements, self-reports its observed role and health after every
//! operation, and classifies its failures as `QueryError`s. Typed query
//! methods live on the concrete client type; callers invoke them inside
//! the closures they hand to the cluster's retry loop.

use async_trait::async_trait;

use crate::error::QueryError;
use crate::node::NodeDef;
use crate::replication::PositionTracker;
use crate::role::{ConnectionIssue, Role};
use crate::shard::ShardNo;

/// A long-lived handle to one node
///
/// Role, health and replication position are the only mutable aspects, and
/// all are monotonic or idempotently re-derived; nothing may mutate a
/// client's identity. Clients are created lazily when their node first
/// appears in a topology snapshot and retired when a later snapshot no
/// longer lists it.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Node this client connects to; identity key in the client pool
    fn node(&self) -> &NodeDef;

    /// Role the server self-reported after the most recent operation
    fn role(&self) -> Role;

    /// Current connectivity problem, if any
    fn connection_issue(&self) -> Option<ConnectionIssue>;

    /// Replication position tracker for this connection
    fn position(&self) -> &PositionTracker;

    /// Shard numbers served by the island this node belongs to
    async fn island_shards(&self) -> Result<Vec<ShardNo>, QueryError>;

    /// Replication position currently reported by the server
    async fn fetch_pos(&self) -> Result<u64, QueryError>;

    /// Close the physical connection and release its resources
    async fn end(&self);

    /// Current replication position, served from the tracker when fresh
    async fn current_pos(&self) -> Result<u64, QueryError> {
        self.position().current(|| self.fetch_pos()).await
    }
}
