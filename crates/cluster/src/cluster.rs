//! Cluster orchestration
//!
//! Owns topology discovery and the per-operation retry loop. Discovery
//! maps shard numbers to islands and is cached through `RefreshedCache`;
//! operations resolve their island from the cached snapshot, pick a
//! connection for the requested role and freshness, execute, and on a
//! classified error apply the suggested recovery action, bounded by a
//! maximum attempt count. Rediscovery requests are coalesced so
//! concurrent failures do not stampede the discovery source.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sg_core::{
    Client, ClusterError, IslandNo, NodeDef, PostAction, QueryError, Role, ShardNo, GLOBAL_SHARD,
};
use tracing::{debug, info, warn};

use crate::cache::{CacheOptions, RefreshedCache};
use crate::coalesce::Coalescer;
use crate::config::ClusterConfig;
use crate::discovery::{merge_shard_claims, DiscoveryIssue, DiscoverySource, TopologySnapshot};
use crate::island::Island;
use crate::registry::Registry;

/// Which connection an operation wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The island's current master
    Master,
    /// Any replica, master only as a fallback
    Replica,
    /// A replica whose replication position has reached the watermark;
    /// the master when none has caught up
    ReplicaAtLeast(u64),
}

/// An error that was handled internally instead of reaching a caller
#[derive(Debug, Clone)]
pub struct SwallowedError {
    /// Where it happened (discovery, rediscovery cause, teardown)
    pub context: String,
    /// What happened
    pub message: String,
    /// How long the failed work ran
    pub elapsed: Duration,
}

/// Timing observation for one executed attempt
#[derive(Debug, Clone)]
pub struct QueryTiming {
    pub shard: ShardNo,
    pub island: IslandNo,
    pub node: NodeDef,
    pub elapsed: Duration,
    pub attempt: usize,
    pub ok: bool,
}

type SwallowedHook = Arc<dyn Fn(&SwallowedError) + Send + Sync>;
type TimingHook = Arc<dyn Fn(&QueryTiming) + Send + Sync>;

/// Everything needed to assemble a `Cluster`
pub struct ClusterOptions<C: Client> {
    /// Tuning knobs
    pub config: ClusterConfig,
    /// Source of the current island layout
    pub discovery: DiscoverySource,
    /// Builds a client for a node the topology just revealed
    pub client_factory: Arc<dyn Fn(&NodeDef) -> C + Send + Sync>,
    /// Observer for errors handled internally; defaults to `tracing`
    pub on_swallowed_error: Option<SwallowedHook>,
    /// Observer for per-attempt timing; off by default
    pub on_query_timing: Option<TimingHook>,
}

/// Init data for the island pool: key is island number plus member list
struct IslandInit<C: Client> {
    no: IslandNo,
    nodes: Vec<NodeDef>,
    clients: Vec<Arc<C>>,
}

struct Inner<C: Client> {
    config: ClusterConfig,
    discovery: DiscoverySource,
    clients: Registry<NodeDef, NodeDef, C>,
    islands: Registry<IslandInit<C>, (IslandNo, Vec<NodeDef>), Island<C>>,
    swallowed: SwallowedHook,
    timing: Option<TimingHook>,
    rediscoveries: AtomicU64,
    swallowed_count: AtomicU64,
}

impl<C: Client> Inner<C> {
    fn report_swallowed(&self, context: &str, message: String, elapsed: Duration) {
        self.swallowed_count.fetch_add(1, Ordering::Relaxed);
        (self.swallowed)(&SwallowedError {
            context: context.to_string(),
            message,
            elapsed,
        });
    }
}

/// Serializable snapshot of pool and discovery counters
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub islands: usize,
    pub clients: usize,
    pub shards: usize,
    pub discovery_issues: usize,
    pub rediscoveries: u64,
    pub swallowed_errors: u64,
}

/// Client-side router for a sharded, replicated cluster
///
/// Cheap to clone; all clones share the same pools, cache and counters.
pub struct Cluster<C: Client> {
    inner: Arc<Inner<C>>,
    cache: Arc<RefreshedCache<TopologySnapshot<C>>>,
    coalescer: Coalescer,
}

impl<C: Client> Clone for Cluster<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cache: self.cache.clone(),
            coalescer: self.coalescer.clone(),
        }
    }
}

impl<C: Client> Cluster<C> {
    /// Assemble a cluster and start its discovery loop
    pub fn new(options: ClusterOptions<C>) -> Self {
        let swallowed: SwallowedHook = options.on_swallowed_error.unwrap_or_else(|| {
            Arc::new(|err: &SwallowedError| {
                warn!(
                    context = %err.context,
                    elapsed_ms = err.elapsed.as_millis() as u64,
                    "swallowed error: {}",
                    err.message
                );
            })
        });

        let factory = options.client_factory.clone();
        let clients = Registry::new(
            |node: &NodeDef| node.clone(),
            move |node| factory(node),
            |client: Arc<C>| async move {
                client.end().await;
                Ok::<(), ClusterError>(())
            },
        );
        let islands = Registry::new(
            |init: &IslandInit<C>| (init.no, init.nodes.clone()),
            |init| Island::new(init.no, init.clients.clone()),
            // Member clients are retired through their own registry
            |_island: Arc<Island<C>>| async move { Ok::<(), ClusterError>(()) },
        );

        let inner = Arc::new(Inner {
            config: options.config,
            discovery: options.discovery,
            clients,
            islands,
            swallowed,
            timing: options.on_query_timing,
            rediscoveries: AtomicU64::new(0),
            swallowed_count: AtomicU64::new(0),
        });

        let on_error_inner = inner.clone();
        let on_slow_inner = inner.clone();
        let resolver_inner = inner.clone();
        let cache = Arc::new(RefreshedCache::new(
            CacheOptions {
                delay: inner.config.discover_interval(),
                warn_timeout: inner.config.discover_warn(),
                deps: None,
                on_error: Some(Box::new(move |err| {
                    on_error_inner.report_swallowed(
                        "discovery",
                        err.to_string(),
                        Duration::ZERO,
                    );
                })),
                on_slow: Some(Box::new(move |elapsed| {
                    on_slow_inner.report_swallowed(
                        "discovery",
                        format!("discovery pass still running after {elapsed:?}"),
                        elapsed,
                    );
                })),
            },
            move || discover(resolver_inner.clone()),
        ));

        let coalescer = Coalescer::new(inner.config.rediscover_delay());
        Self {
            inner,
            cache,
            coalescer,
        }
    }

    /// Cached topology snapshot, discovering it on first use
    pub async fn topology(&self) -> Result<TopologySnapshot<C>, ClusterError> {
        self.cache.cached().await
    }

    /// Force a fresh discovery pass and wait for it
    pub async fn rediscover_now(&self) -> Result<TopologySnapshot<C>, ClusterError> {
        self.cache.refresh_and_wait().await
    }

    /// Island serving a shard
    ///
    /// Unknown shards fail fast and never trigger rediscovery: an invalid
    /// shard number must not become a denial-of-service vector against
    /// the discovery subsystem.
    pub async fn island_for_shard(&self, shard: ShardNo) -> Result<Arc<Island<C>>, ClusterError> {
        self.cache.cached().await?.island_for_shard(shard)
    }

    /// Island serving cluster-wide data
    pub async fn global_island(&self) -> Result<Arc<Island<C>>, ClusterError> {
        self.island_for_shard(GLOBAL_SHARD).await
    }

    /// Connection on the island serving `shard`, for the requested target
    pub async fn client_for_shard(
        &self,
        shard: ShardNo,
        target: Target,
    ) -> Result<Arc<C>, ClusterError> {
        let island = self.island_for_shard(shard).await?;
        Ok(self.pick(&island, target).await)
    }

    /// Run an operation against a shard with bounded retries
    ///
    /// Each attempt re-reads the cached snapshot, so a rediscovery
    /// finished by a concurrent caller is observed without extra
    /// signaling. The recovery action after a failure comes from the
    /// error's classification, never from the caller.
    pub async fn run_on_shard<T, F, Fut>(
        &self,
        shard: ShardNo,
        target: Target,
        op: F,
    ) -> Result<T, ClusterError>
    where
        F: Fn(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let attempts = self.inner.config.max_attempts.max(1);
        let mut last_err: Option<QueryError> = None;

        for attempt in 1..=attempts {
            let snapshot = self.cache.cached().await?;
            let island = snapshot.island_for_shard(shard)?;
            let client = self.pick(&island, target).await;

            let begun = Instant::now();
            let result = op(client.clone()).await;
            if let Some(hook) = &self.inner.timing {
                hook(&QueryTiming {
                    shard,
                    island: island.no(),
                    node: client.node().clone(),
                    elapsed: begun.elapsed(),
                    attempt,
                    ok: result.is_ok(),
                });
            }

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        shard,
                        island = island.no(),
                        node = %client.node(),
                        attempt,
                        post_action = ?err.post_action,
                        "attempt failed: {err}"
                    );
                    match err.post_action {
                        PostAction::Fail => return Err(err.into()),
                        PostAction::ChooseAnotherClient => {}
                        PostAction::RediscoverIsland => {
                            self.rediscover(&format!("island-{}", island.no())).await;
                        }
                        PostAction::RediscoverCluster => {
                            self.rediscover("cluster").await;
                        }
                    }
                    last_err = Some(err);
                }
            }
        }

        // The loop runs at least once, so a missing value means a bug here
        let last = last_err.expect("at least one attempt ran");
        Err(ClusterError::AttemptsExhausted { attempts, last })
    }

    /// Pool and discovery counters for diagnostics
    pub fn stats(&self) -> ClusterStats {
        let snapshot = self.cache.peek();
        ClusterStats {
            islands: self.inner.islands.len(),
            clients: self.inner.clients.len(),
            shards: snapshot.as_ref().map(|s| s.shard_count()).unwrap_or(0),
            discovery_issues: snapshot.as_ref().map(|s| s.issues().len()).unwrap_or(0),
            rediscoveries: self.inner.rediscoveries.load(Ordering::Relaxed),
            swallowed_errors: self.inner.swallowed_count.load(Ordering::Relaxed),
        }
    }

    /// Stop the discovery loop and retire every pooled client and island
    pub async fn shutdown(&self) {
        info!("cluster shutting down");
        self.cache.destroy();
        self.inner.islands.clear();
        self.inner.clients.clear();
    }

    async fn pick(&self, island: &Arc<Island<C>>, target: Target) -> Arc<C> {
        match target {
            Target::Master => island.master(),
            Target::Replica => island.replica(),
            Target::ReplicaAtLeast(pos) => {
                let replica = island.replica();
                if replica.role() != Role::Replica {
                    // Replica selection already fell back to the master
                    return replica;
                }
                match replica.current_pos().await {
                    Ok(current) if current >= pos => replica,
                    Ok(current) => {
                        debug!(
                            island = island.no(),
                            node = %replica.node(),
                            current,
                            wanted = pos,
                            "replica behind watermark, using master"
                        );
                        island.master()
                    }
                    Err(err) => {
                        debug!(
                            island = island.no(),
                            node = %replica.node(),
                            "replica position unknown ({err}), using master"
                        );
                        island.master()
                    }
                }
            }
        }
    }

    /// Share one delayed rediscovery among concurrent callers per cause
    async fn rediscover(&self, cause: &str) {
        let cache = self.cache.clone();
        let inner = self.inner.clone();
        let ceiling = self.inner.config.discover_timeout();
        let cause_owned = cause.to_string();
        self.coalescer
            .run(cause, move || async move {
                inner.rediscoveries.fetch_add(1, Ordering::Relaxed);
                let begun = Instant::now();
                match tokio::time::timeout(ceiling, cache.refresh_and_wait()).await {
                    Ok(Ok(_)) => debug!(cause = %cause_owned, "rediscovery finished"),
                    Ok(Err(err)) => {
                        inner.report_swallowed(&cause_owned, err.to_string(), begun.elapsed());
                    }
                    Err(_) => {
                        inner.report_swallowed(
                            &cause_owned,
                            format!("rediscovery abandoned after {ceiling:?}"),
                            begun.elapsed(),
                        );
                    }
                }
            })
            .await;
    }
}

/// One full discovery pass
///
/// Builds (or reuses) clients and islands for everything the discovery
/// source reports, asks every island which shards it serves, merges the
/// claims, and retires pool entries the new topology no longer mentions.
async fn discover<C: Client>(inner: Arc<Inner<C>>) -> Result<TopologySnapshot<C>, ClusterError> {
    let begun = Instant::now();
    let defs = (inner.discovery)().await?;

    let mut issues: Vec<DiscoveryIssue> = Vec::new();
    let mut islands: HashMap<IslandNo, Arc<Island<C>>> = HashMap::new();
    let mut claims: Vec<(IslandNo, Vec<ShardNo>)> = Vec::new();
    let mut keep_clients: HashSet<NodeDef> = HashSet::new();
    let mut keep_islands: HashSet<(IslandNo, Vec<NodeDef>)> = HashSet::new();

    for def in &defs {
        if def.nodes.is_empty() {
            issues.push(DiscoveryIssue {
                island: def.no,
                node: None,
                message: "island has no nodes".to_string(),
            });
            continue;
        }
        if islands.contains_key(&def.no) {
            issues.push(DiscoveryIssue {
                island: def.no,
                node: None,
                message: "island listed twice by the discovery source".to_string(),
            });
            continue;
        }

        let clients: Vec<Arc<C>> = def
            .nodes
            .iter()
            .map(|node| {
                keep_clients.insert(node.clone());
                inner.clients.get_or_create(node)
            })
            .collect();
        let init = IslandInit {
            no: def.no,
            nodes: def.nodes.clone(),
            clients,
        };
        keep_islands.insert(inner.islands.key_of(&init));
        let island = inner.islands.get_or_create(&init);

        if let Some(shards) = fetch_island_shards(&island, &mut issues).await {
            claims.push((def.no, shards));
        }
        islands.insert(def.no, island);
    }

    let shard_to_island = merge_shard_claims(&claims)?;

    inner.clients.delete_except(&keep_clients);
    inner.islands.delete_except(&keep_islands);

    info!(
        islands = islands.len(),
        shards = shard_to_island.len(),
        issues = issues.len(),
        elapsed_ms = begun.elapsed().as_millis() as u64,
        "topology discovered"
    );
    Ok(TopologySnapshot::new(shard_to_island, islands, issues))
}

/// Ask one island which shards it serves, master first, then the rest
async fn fetch_island_shards<C: Client>(
    island: &Arc<Island<C>>,
    issues: &mut Vec<DiscoveryIssue>,
) -> Option<Vec<ShardNo>> {
    let mut candidates: Vec<Arc<C>> = vec![island.master()];
    for client in island.clients() {
        if !candidates.iter().any(|c| c.node() == client.node()) {
            candidates.push(client.clone());
        }
    }

    for client in candidates {
        match client.island_shards().await {
            Ok(shards) => return Some(shards),
            Err(err) => issues.push(DiscoveryIssue {
                island: island.no(),
                node: Some(client.node().clone()),
                message: err.to_string(),
            }),
        }
    }
    None
}
