//! Shared vocabulary for the shardgate routing layer
//!
//! Defines the types every other crate speaks:
//!
//! - `shard`: shard/island identifiers and discovery definitions
//! - `node`: connection-target descriptors
//! - `role`: observed roles and connection health
//! - `error`: the classified error taxonomy
//! - `replication`: per-connection replication position tracking
//! - `client`: the physical executor contract

pub mod client;
pub mod error;
pub mod node;
pub mod replication;
pub mod role;
pub mod shard;

pub use client::Client;
pub use error::{ClusterError, ErrorKind, PostAction, QueryError};
pub use node::NodeDef;
pub use replication::PositionTracker;
pub use role::{ConnectionIssue, Role};
pub use shard::{IslandDef, IslandNo, ShardNo, GLOBAL_SHARD};
