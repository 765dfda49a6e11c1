//! Replica set serving one consistency domain
//!
//! An island groups the connections to one master and its replicas.
//! Which connection currently plays which role is decided per call from
//! the roles the servers last self-reported and the current health flags:
//! cluster failover can promote a node without this layer being told, so
//! nothing here trusts a static assignment or caches a decision past one
//! call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use sg_core::{Client, IslandNo, Role};

/// Immutable-once-constructed set of connections to one island
///
/// Rebuilt, never mutated, whenever the member node list changes; the old
/// instance is retired through the island registry.
#[derive(Debug)]
pub struct Island<C: Client> {
    no: IslandNo,
    clients: Vec<Arc<C>>,
    // Rotation cursor for spreading reads over eligible replicas
    replica_cursor: AtomicUsize,
}

impl<C: Client> Island<C> {
    /// Build an island over its member connections
    ///
    /// The list must be non-empty: an island with no connections cannot
    /// answer anything, and discovery drops such islands before they
    /// reach this constructor.
    pub fn new(no: IslandNo, clients: Vec<Arc<C>>) -> Self {
        assert!(!clients.is_empty(), "island {no} has no clients");
        let start = rand::thread_rng().gen_range(0..clients.len());
        Self {
            no,
            clients,
            replica_cursor: AtomicUsize::new(start),
        }
    }

    /// Island number
    pub fn no(&self) -> IslandNo {
        self.no
    }

    /// All member connections
    pub fn clients(&self) -> &[Arc<C>] {
        &self.clients
    }

    /// Best-guess master connection; never fails
    ///
    /// Preference order: a healthy connection self-reporting master, then
    /// any connection still claiming master even if unhealthy (the known
    /// master stays trusted until another node claims the role), then any
    /// healthy connection, then the first connection at all.
    pub fn master(&self) -> Arc<C> {
        if let Some(client) = self
            .clients
            .iter()
            .find(|c| c.role() == Role::Master && c.connection_issue().is_none())
        {
            return client.clone();
        }
        if let Some(client) = self.clients.iter().find(|c| c.role() == Role::Master) {
            return client.clone();
        }
        if let Some(client) = self
            .clients
            .iter()
            .find(|c| c.connection_issue().is_none())
        {
            return client.clone();
        }
        // Constructor guarantees at least one client
        self.clients[0].clone()
    }

    /// A connection for reads, rotating over healthy replicas
    ///
    /// Falls back to the master when every replica is unhealthy, and to
    /// the least-unhealthy replica when even the master is unhealthy. The
    /// least-unhealthy replica is the one whose issue appeared most
    /// recently: it was verified healthy the most recently.
    pub fn replica(&self) -> Arc<C> {
        let eligible: Vec<&Arc<C>> = self
            .clients
            .iter()
            .filter(|c| c.role() == Role::Replica && c.connection_issue().is_none())
            .collect();
        if !eligible.is_empty() {
            let at = self.replica_cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
            return eligible[at].clone();
        }

        let master = self.master();
        if master.connection_issue().is_none() {
            return master;
        }

        self.clients
            .iter()
            .filter(|c| c.role() == Role::Replica)
            .max_by_key(|c| c.connection_issue().map(|issue| issue.since))
            .cloned()
            .unwrap_or(master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sg_core::{ConnectionIssue, NodeDef, PositionTracker, QueryError, ShardNo};
    use std::collections::HashSet;
    use std::time::Duration;

    struct FakeClient {
        node: NodeDef,
        role: Mutex<Role>,
        issue: Mutex<Option<ConnectionIssue>>,
        position: PositionTracker,
    }

    impl FakeClient {
        fn new(name: &str, role: Role) -> Arc<Self> {
            Arc::new(Self {
                node: NodeDef::new(name, 5432),
                role: Mutex::new(role),
                issue: Mutex::new(None),
                position: PositionTracker::new(Duration::from_secs(1)),
            })
        }

        fn set_unhealthy(&self, comment: &str) {
            *self.issue.lock() = Some(ConnectionIssue::new(comment));
        }

        fn set_role(&self, role: Role) {
            *self.role.lock() = role;
        }
    }

    #[async_trait]
    impl Client for FakeClient {
        fn node(&self) -> &NodeDef {
            &self.node
        }
        fn role(&self) -> Role {
            *self.role.lock()
        }
        fn connection_issue(&self) -> Option<ConnectionIssue> {
            self.issue.lock().clone()
        }
        fn position(&self) -> &PositionTracker {
            &self.position
        }
        async fn island_shards(&self) -> Result<Vec<ShardNo>, QueryError> {
            Ok(vec![])
        }
        async fn fetch_pos(&self) -> Result<u64, QueryError> {
            Ok(0)
        }
        async fn end(&self) {}
    }

    #[test]
    #[should_panic(expected = "has no clients")]
    fn test_empty_island_is_rejected() {
        let _ = Island::<FakeClient>::new(1, vec![]);
    }

    #[test]
    fn test_unhealthy_master_stays_master_but_not_replica() {
        let a = FakeClient::new("a", Role::Master);
        let b = FakeClient::new("b", Role::Replica);
        let island = Island::new(1, vec![a.clone(), b.clone()]);

        assert_eq!(island.master().node().host, "a");

        a.set_unhealthy("connect timeout");
        // The known master is trusted even while unhealthy
        assert_eq!(island.master().node().host, "a");
        // Reads go to the healthy replica
        assert_eq!(island.replica().node().host, "b");
    }

    #[test]
    fn test_failover_re_elects_on_observed_roles() {
        let a = FakeClient::new("a", Role::Master);
        let b = FakeClient::new("b", Role::Replica);
        let island = Island::new(1, vec![a.clone(), b.clone()]);

        // Failover observed: b now self-reports master, a degrades
        a.set_role(Role::Replica);
        b.set_role(Role::Master);
        assert_eq!(island.master().node().host, "b");
    }

    #[test]
    fn test_replica_rotation_spreads_reads() {
        let a = FakeClient::new("a", Role::Master);
        let b = FakeClient::new("b", Role::Replica);
        let c = FakeClient::new("c", Role::Replica);
        let island = Island::new(1, vec![a, b, c]);

        let mut seen = HashSet::new();
        for _ in 0..10 {
            seen.insert(island.replica().node().host.clone());
        }
        assert_eq!(
            seen,
            ["b".to_string(), "c".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_all_replicas_unhealthy_falls_back_to_master() {
        let a = FakeClient::new("a", Role::Master);
        let b = FakeClient::new("b", Role::Replica);
        let island = Island::new(1, vec![a.clone(), b.clone()]);

        b.set_unhealthy("gone");
        assert_eq!(island.replica().node().host, "a");
    }

    #[test]
    fn test_everything_unhealthy_picks_least_unhealthy_replica() {
        let a = FakeClient::new("a", Role::Master);
        let b = FakeClient::new("b", Role::Replica);
        let c = FakeClient::new("c", Role::Replica);
        let island = Island::new(1, vec![a.clone(), b.clone(), c.clone()]);

        b.set_unhealthy("first down");
        std::thread::sleep(Duration::from_millis(5));
        a.set_unhealthy("master down");
        std::thread::sleep(Duration::from_millis(5));
        c.set_unhealthy("just went down");

        // c failed most recently, so it was healthy most recently
        assert_eq!(island.replica().node().host, "c");
    }

    #[test]
    fn test_unknown_roles_still_give_a_master() {
        let a = FakeClient::new("a", Role::Unknown);
        let b = FakeClient::new("b", Role::Unknown);
        let island = Island::new(1, vec![a.clone(), b]);

        // No one claims master yet; first healthy connection is the guess
        assert_eq!(island.master().node().host, "a");
    }
}
