//! Topology snapshots and shard-claim merging
//!
//! One discovery pass produces a `TopologySnapshot`: which island serves
//! which shard, the live islands, and whatever went wrong along the way.
//! Snapshots are immutable; a new pass builds a new one and swaps it in
//! through the topology cache.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sg_core::{Client, ClusterError, IslandDef, IslandNo, NodeDef, ShardNo};

use crate::island::Island;

/// Caller-supplied source of the current island layout
///
/// May be re-invoked at any time and must be safe to call repeatedly.
pub type DiscoverySource = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Vec<IslandDef>, ClusterError>> + Send>>
        + Send
        + Sync,
>;

/// Build a discovery source from an async closure
pub fn discovery_source<F, Fut>(f: F) -> DiscoverySource
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<IslandDef>, ClusterError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// A non-fatal problem collected during one discovery pass
///
/// Kept on the snapshot for diagnostics: when a shard cannot be located,
/// these explain what discovery could not see.
#[derive(Debug, Clone)]
pub struct DiscoveryIssue {
    /// Island the problem belongs to
    pub island: IslandNo,
    /// Node that failed, when the problem is node-specific
    pub node: Option<NodeDef>,
    /// What happened
    pub message: String,
}

/// Result of one discovery pass
#[derive(Debug)]
pub struct TopologySnapshot<C: Client> {
    shard_to_island: HashMap<ShardNo, IslandNo>,
    islands: HashMap<IslandNo, Arc<Island<C>>>,
    issues: Vec<DiscoveryIssue>,
}

impl<C: Client> TopologySnapshot<C> {
    pub(crate) fn new(
        shard_to_island: HashMap<ShardNo, IslandNo>,
        islands: HashMap<IslandNo, Arc<Island<C>>>,
        issues: Vec<DiscoveryIssue>,
    ) -> Self {
        Self {
            shard_to_island,
            islands,
            issues,
        }
    }

    /// Island serving a shard
    ///
    /// Fails with a non-retryable error when the shard is unknown; an
    /// invalid shard number must never be able to trigger rediscovery.
    pub fn island_for_shard(&self, shard: ShardNo) -> Result<Arc<Island<C>>, ClusterError> {
        let island_no = self
            .shard_to_island
            .get(&shard)
            .ok_or(ClusterError::ShardNotDiscoverable(shard))?;
        self.islands
            .get(island_no)
            .cloned()
            .ok_or(ClusterError::IslandNotFound(*island_no))
    }

    /// Island by number
    pub fn island(&self, no: IslandNo) -> Result<Arc<Island<C>>, ClusterError> {
        self.islands
            .get(&no)
            .cloned()
            .ok_or(ClusterError::IslandNotFound(no))
    }

    /// All live islands, ordered by island number
    pub fn islands(&self) -> Vec<Arc<Island<C>>> {
        let mut nos: Vec<IslandNo> = self.islands.keys().copied().collect();
        nos.sort_unstable();
        nos.iter().filter_map(|no| self.islands.get(no).cloned()).collect()
    }

    /// Shard numbers with a known island, unordered
    pub fn shards(&self) -> Vec<ShardNo> {
        self.shard_to_island.keys().copied().collect()
    }

    /// Number of mapped shards
    pub fn shard_count(&self) -> usize {
        self.shard_to_island.len()
    }

    /// Problems collected while this snapshot was built
    pub fn issues(&self) -> &[DiscoveryIssue] {
        &self.issues
    }
}

impl<C: Client> Clone for TopologySnapshot<C> {
    fn clone(&self) -> Self {
        Self {
            shard_to_island: self.shard_to_island.clone(),
            islands: self.islands.clone(),
            issues: self.issues.clone(),
        }
    }
}

/// Merge per-island shard claims into one shard→island map
///
/// A shard claimed by two islands is a misconfigured cluster and fails
/// the whole pass; serving such a shard from either island could split
/// writes between two masters.
pub(crate) fn merge_shard_claims(
    claims: &[(IslandNo, Vec<ShardNo>)],
) -> Result<HashMap<ShardNo, IslandNo>, ClusterError> {
    let mut map: HashMap<ShardNo, IslandNo> = HashMap::new();
    for (island, shards) in claims {
        for shard in shards {
            if let Some(first) = map.insert(*shard, *island) {
                if first != *island {
                    return Err(ClusterError::ShardClaimedTwice {
                        shard: *shard,
                        first,
                        second: *island,
                    });
                }
            }
        }
    }
    Ok(map)
}
