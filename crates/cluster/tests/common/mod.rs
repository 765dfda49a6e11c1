//! Shared mock backend for cluster integration tests
//!
//! One `MockBackend` plays the whole physical cluster: it owns the island
//! layout the discovery source reports and the per-node state (role,
//! health, served shards, replication position) every `MockClient` reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster::discovery::{discovery_source, DiscoverySource};
use parking_lot::Mutex;
use sg_core::{
    Client, ClusterError, ConnectionIssue, ErrorKind, IslandDef, NodeDef, PositionTracker,
    PostAction, QueryError, Role, ShardNo,
};

/// Install a fmt subscriber once so failing tests show the router's logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Server-side state of one mock node
#[derive(Debug, Clone)]
pub struct NodeState {
    pub role: Role,
    pub healthy: bool,
    pub shards: Vec<ShardNo>,
    pub pos: u64,
}

impl NodeState {
    pub fn master(shards: &[ShardNo]) -> Self {
        Self {
            role: Role::Master,
            healthy: true,
            shards: shards.to_vec(),
            pos: 0,
        }
    }

    pub fn replica(shards: &[ShardNo]) -> Self {
        Self {
            role: Role::Replica,
            healthy: true,
            shards: shards.to_vec(),
            pos: 0,
        }
    }
}

/// The whole fake cluster
#[derive(Debug, Default)]
pub struct MockBackend {
    pub islands: Mutex<Vec<IslandDef>>,
    pub nodes: Mutex<HashMap<NodeDef, NodeState>>,
    pub discoveries: AtomicUsize,
    pub fail_discovery: AtomicBool,
    pub ended: Mutex<Vec<NodeDef>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node(name: &str) -> NodeDef {
        NodeDef::new(name, 5432)
    }

    pub fn put_node(&self, name: &str, state: NodeState) -> NodeDef {
        let node = Self::node(name);
        self.nodes.lock().insert(node.clone(), state.clone());
        node
    }

    pub fn set_islands(&self, islands: Vec<IslandDef>) {
        *self.islands.lock() = islands;
    }

    pub fn set_role(&self, name: &str, role: Role) {
        if let Some(state) = self.nodes.lock().get_mut(&Self::node(name)) {
            state.role = role;
        }
    }

    pub fn set_pos(&self, name: &str, pos: u64) {
        if let Some(state) = self.nodes.lock().get_mut(&Self::node(name)) {
            state.pos = pos;
        }
    }

    pub fn discovery_source(self: &Arc<Self>) -> DiscoverySource {
        let backend = self.clone();
        discovery_source(move || {
            let backend = backend.clone();
            async move {
                backend.discoveries.fetch_add(1, Ordering::SeqCst);
                if backend.fail_discovery.load(Ordering::SeqCst) {
                    return Err(ClusterError::Discovery("control plane unreachable".into()));
                }
                Ok(backend.islands.lock().clone())
            }
        })
    }

    pub fn client_factory(
        self: &Arc<Self>,
    ) -> Arc<dyn Fn(&NodeDef) -> MockClient + Send + Sync> {
        let backend = self.clone();
        Arc::new(move |node| MockClient {
            node: node.clone(),
            backend: backend.clone(),
            position: PositionTracker::new(Duration::from_millis(10)),
        })
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }
}

/// Client handle over one mock node
#[derive(Debug)]
pub struct MockClient {
    node: NodeDef,
    backend: Arc<MockBackend>,
    position: PositionTracker,
}

impl MockClient {
    fn state(&self) -> Option<NodeState> {
        self.backend.nodes.lock().get(&self.node).cloned()
    }
}

#[async_trait]
impl Client for MockClient {
    fn node(&self) -> &NodeDef {
        &self.node
    }

    fn role(&self) -> Role {
        self.state().map(|s| s.role).unwrap_or(Role::Unknown)
    }

    fn connection_issue(&self) -> Option<ConnectionIssue> {
        match self.state() {
            Some(state) if state.healthy => None,
            _ => Some(ConnectionIssue::new("node unreachable")),
        }
    }

    fn position(&self) -> &PositionTracker {
        &self.position
    }

    async fn island_shards(&self) -> Result<Vec<ShardNo>, QueryError> {
        self.state().map(|s| s.shards).ok_or_else(|| {
            QueryError::new(
                PostAction::ChooseAnotherClient,
                ErrorKind::DataOnServerIsUnchanged,
                "node is gone",
            )
        })
    }

    async fn fetch_pos(&self) -> Result<u64, QueryError> {
        self.state().map(|s| s.pos).ok_or_else(|| {
            QueryError::new(
                PostAction::ChooseAnotherClient,
                ErrorKind::DataOnServerIsUnchanged,
                "node is gone",
            )
        })
    }

    async fn end(&self) {
        self.backend.ended.lock().push(self.node.clone());
    }
}
