//! Keyed pool of long-lived objects
//!
//! Backs both the client pool (keyed by node) and the island pool (keyed
//! by island number plus member list). Repeated discovery passes that see
//! an unchanged topology get back the exact same objects; objects whose
//! key disappears from a snapshot are retired through an async end hook.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use sg_core::ClusterError;
use tracing::{debug, warn};

type EndFuture = Pin<Box<dyn Future<Output = Result<(), ClusterError>> + Send>>;

/// Keyed object pool with deferred teardown
///
/// `I` is the init data a caller holds, `K` the stable key derived from
/// it, `V` the pooled object. Retirement never invalidates handles already
/// given out: the `Arc` a caller holds stays alive until the caller drops
/// it, only the pool entry goes away.
pub struct Registry<I, K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    key_of: Box<dyn Fn(&I) -> K + Send + Sync>,
    create: Box<dyn Fn(&I) -> V + Send + Sync>,
    end: Arc<dyn Fn(Arc<V>) -> EndFuture + Send + Sync>,
    entries: Mutex<HashMap<K, Arc<V>>>,
}

impl<I, K, V> Registry<I, K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a pool from a key function, a constructor and an end hook
    pub fn new<KF, CF, EF, Fut>(key_of: KF, create: CF, end: EF) -> Self
    where
        KF: Fn(&I) -> K + Send + Sync + 'static,
        CF: Fn(&I) -> V + Send + Sync + 'static,
        EF: Fn(Arc<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClusterError>> + Send + 'static,
    {
        Self {
            key_of: Box::new(key_of),
            create: Box::new(create),
            end: Arc::new(move |v| Box::pin(end(v))),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Key the pool derives for this init data
    pub fn key_of(&self, init: &I) -> K {
        (self.key_of)(init)
    }

    /// Existing object for this init data's key, or a newly built one
    pub fn get_or_create(&self, init: &I) -> Arc<V> {
        let key = (self.key_of)(init);
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return existing.clone();
        }
        debug!(key = ?key, "registry creating object");
        let created = Arc::new((self.create)(init));
        entries.insert(key, created.clone());
        created
    }

    /// Object stored for a key, if any
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().get(key).cloned()
    }

    /// All keys currently pooled
    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Number of pooled objects
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is pooled
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove and asynchronously tear down every entry whose key is not
    /// in `keep`; returns how many entries were retired
    ///
    /// Teardown runs on detached tasks. A failing end hook is logged and
    /// never blocks the removal of other entries.
    pub fn delete_except(&self, keep: &HashSet<K>) -> usize {
        let retired: Vec<(K, Arc<V>)> = {
            let mut entries = self.entries.lock();
            let gone: Vec<K> = entries
                .keys()
                .filter(|k| !keep.contains(*k))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|k| entries.remove(&k).map(|v| (k, v)))
                .collect()
        };

        let count = retired.len();
        for (key, object) in retired {
            let end = self.end.clone();
            tokio::spawn(async move {
                if let Err(err) = end(object).await {
                    warn!(key = ?key, error = %err, "registry teardown failed");
                }
            });
        }
        count
    }

    /// Retire everything; used at shutdown
    pub fn clear(&self) -> usize {
        self.delete_except(&HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counter_registry(
        ended: Arc<AtomicUsize>,
    ) -> Registry<(String, u32), String, (String, u32)> {
        Registry::new(
            |init: &(String, u32)| init.0.clone(),
            |init| init.clone(),
            move |_| {
                let ended = ended.clone();
                async move {
                    ended.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn test_identity_is_stable_across_passes() {
        let registry = counter_registry(Arc::new(AtomicUsize::new(0)));

        let a1 = registry.get_or_create(&("db1".to_string(), 1));
        let a2 = registry.get_or_create(&("db1".to_string(), 999));
        assert!(Arc::ptr_eq(&a1, &a2), "same key must give the same object");
        assert_eq!(a1.1, 1, "existing object wins over new init data");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_except_retires_and_ends() {
        let ended = Arc::new(AtomicUsize::new(0));
        let registry = counter_registry(ended.clone());

        registry.get_or_create(&("db1".to_string(), 1));
        registry.get_or_create(&("db2".to_string(), 2));
        registry.get_or_create(&("db3".to_string(), 3));

        let keep: HashSet<String> = ["db2".to_string()].into_iter().collect();
        let retired = registry.delete_except(&keep);
        assert_eq!(retired, 2);
        assert_eq!(registry.keys(), vec!["db2".to_string()]);

        // End hooks run on detached tasks
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ended.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_teardown_does_not_block_others() {
        let ended = Arc::new(AtomicUsize::new(0));
        let counted = ended.clone();
        let registry: Registry<String, String, String> = Registry::new(
            |init: &String| init.clone(),
            |init| init.clone(),
            move |v: Arc<String>| {
                let counted = counted.clone();
                async move {
                    if v.as_str() == "bad" {
                        return Err(ClusterError::Discovery("teardown failed".into()));
                    }
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        registry.get_or_create(&"bad".to_string());
        registry.get_or_create(&"good".to_string());
        assert_eq!(registry.clear(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handles_survive_retirement() {
        let registry = counter_registry(Arc::new(AtomicUsize::new(0)));
        let held = registry.get_or_create(&("db1".to_string(), 1));
        registry.clear();
        // The pool entry is gone but the handle is still usable
        assert_eq!(held.0, "db1");
        assert!(registry.get(&"db1".to_string()).is_none());
    }
}
