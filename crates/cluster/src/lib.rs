//! Topology discovery, caching and retry orchestration
//!
//! The routing half of shardgate:
//!
//! - `cache`: generic cached value with background refresh
//! - `registry`: keyed pool of long-lived objects with deferred teardown
//! - `island`: replica set with per-call role re-election
//! - `discovery`: topology snapshots and shard-claim merging
//! - `coalesce`: keyed single-flight actions for rediscovery
//! - `cluster`: the retry state machine tying it all together
//! - `config`: YAML-loadable tuning knobs

pub mod cache;
pub mod cluster;
pub mod coalesce;
pub mod config;
pub mod discovery;
pub mod island;
pub mod registry;

pub use cache::{CacheOptions, Deps, RefreshedCache};
pub use cluster::{Cluster, ClusterOptions, ClusterStats, QueryTiming, SwallowedError, Target};
pub use coalesce::Coalescer;
pub use config::{ClusterConfig, ConfigError};
pub use discovery::{discovery_source, DiscoveryIssue, DiscoverySource, TopologySnapshot};
pub use island::Island;
pub use registry::Registry;
