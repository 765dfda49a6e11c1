//! Cached value with background refresh
//!
//! Generic primitive behind all discovery caching: holds a value produced
//! by an async resolver, re-resolves it on a timer, and tolerates resolver
//! failure or slowness by keeping the previous value live. Resolutions are
//! strictly sequential per instance; concurrent callers share whatever
//! resolution is in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sg_core::ClusterError;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Resolver<T> =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<T, ClusterError>> + Send>> + Send + Sync>;

/// Dependency check that can cut a refresh delay short
///
/// The handler is polled during the inter-refresh delay; when its output
/// differs from the output captured after the previous resolution, the
/// delay ends early and a new resolution starts.
pub struct Deps {
    /// How often to poll the handler during the delay
    pub interval: Duration,
    /// Produces a fingerprint of whatever the cached value depends on
    pub handler: Box<dyn Fn() -> String + Send + Sync>,
}

/// Tuning and observer hooks for a `RefreshedCache`
pub struct CacheOptions {
    /// Delay between successful resolutions
    pub delay: Duration,
    /// A resolution running longer than this triggers the slow hook, but
    /// is not aborted
    pub warn_timeout: Duration,
    /// Optional dependency check cutting the delay short
    pub deps: Option<Deps>,
    /// Called when a resolution fails; the previous value stays live
    pub on_error: Option<Box<dyn Fn(&ClusterError) + Send + Sync>>,
    /// Called when a resolution exceeds `warn_timeout`
    pub on_slow: Option<Box<dyn Fn(Duration) + Send + Sync>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            warn_timeout: Duration::from_secs(30),
            deps: None,
            on_error: None,
            on_slow: None,
        }
    }
}

#[derive(Debug)]
struct Published<T> {
    /// Number of resolutions that have completed, success or failure
    completed: u64,
    /// Latest successfully resolved value
    value: Option<T>,
    /// Latest resolution error; only surfaced while no value exists
    last_error: Option<ClusterError>,
    destroyed: bool,
}

struct Shared<T> {
    tx: watch::Sender<Published<T>>,
    /// Number of resolutions that have started
    started: AtomicU64,
    /// Cuts the inter-refresh delay short
    skip: Notify,
}

/// A value resolved asynchronously and refreshed in the background
///
/// `cached()` returns the most recent successfully resolved value, waiting
/// only when none exists yet. `refresh_and_wait()` waits for a resolution
/// that began after the call. `destroy()` stops the refresh loop and fails
/// all pending and future waits.
pub struct RefreshedCache<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> RefreshedCache<T> {
    /// Start the resolve loop and return the cache handle
    pub fn new<R, Fut>(options: CacheOptions, resolver: R) -> Self
    where
        R: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ClusterError>> + Send + 'static,
    {
        let resolver: Resolver<T> = Box::new(move || Box::pin(resolver()));
        let (tx, _rx) = watch::channel(Published {
            completed: 0,
            value: None,
            last_error: None,
            destroyed: false,
        });
        let shared = Arc::new(Shared {
            tx,
            started: AtomicU64::new(0),
            skip: Notify::new(),
        });

        let task = tokio::spawn(resolve_loop(shared.clone(), options, resolver));

        Self {
            shared,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Most recent successfully resolved value; waits only before the
    /// first resolution completes
    ///
    /// A resolution failure before any good value exists is propagated;
    /// once a good value exists, later failures never surface here.
    pub async fn cached(&self) -> Result<T, ClusterError> {
        let mut rx = self.shared.tx.subscribe();
        let state = rx
            .wait_for(|s| s.destroyed || s.completed > 0)
            .await
            .map_err(|_| ClusterError::Destroyed)?;
        Self::extract(&state)
    }

    /// Force a new resolution and wait for one that began after this call
    ///
    /// Never returns a value whose resolution was already in flight when
    /// the call was made.
    pub async fn refresh_and_wait(&self) -> Result<T, ClusterError> {
        // Any resolution started at or before this point began before the
        // call; completions are sequential, so requiring one more
        // completion than that is exactly "began after".
        let need = self.shared.started.load(Ordering::SeqCst) + 1;
        self.shared.skip.notify_one();

        let mut rx = self.shared.tx.subscribe();
        let state = rx
            .wait_for(|s| s.destroyed || s.completed >= need)
            .await
            .map_err(|_| ClusterError::Destroyed)?;
        Self::extract(&state)
    }

    /// Latest value without waiting, if any resolution has succeeded
    pub fn peek(&self) -> Option<T> {
        self.shared.tx.borrow().value.clone()
    }

    /// Stop the resolve loop; all pending and future waits fail
    pub fn destroy(&self) {
        self.shared.tx.send_modify(|s| s.destroyed = true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn extract(state: &Published<T>) -> Result<T, ClusterError> {
        if state.destroyed {
            return Err(ClusterError::Destroyed);
        }
        match (&state.value, &state.last_error) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(err)) => Err(err.clone()),
            (None, None) => Err(ClusterError::Destroyed),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for RefreshedCache<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn resolve_loop<T: Clone + Send + Sync + 'static>(
    shared: Arc<Shared<T>>,
    options: CacheOptions,
    resolver: Resolver<T>,
) {
    loop {
        if shared.tx.borrow().destroyed {
            return;
        }

        shared.started.fetch_add(1, Ordering::SeqCst);
        let begun = Instant::now();
        let result = {
            let fut = resolver();
            tokio::pin!(fut);
            tokio::select! {
                res = &mut fut => res,
                _ = tokio::time::sleep(options.warn_timeout) => {
                    match &options.on_slow {
                        Some(hook) => hook(begun.elapsed()),
                        None => warn!(
                            elapsed_ms = begun.elapsed().as_millis() as u64,
                            "cache resolution is slow, still waiting"
                        ),
                    }
                    fut.await
                }
            }
        };

        let deps_snapshot = options.deps.as_ref().map(|d| (d.handler)());
        shared.tx.send_modify(|s| {
            s.completed += 1;
            match result {
                Ok(value) => {
                    s.value = Some(value);
                    s.last_error = None;
                }
                Err(err) => {
                    match &options.on_error {
                        Some(hook) => hook(&err),
                        None => error!(error = %err, "cache resolution failed"),
                    }
                    s.last_error = Some(err);
                }
            }
        });

        if shared.tx.borrow().destroyed {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(options.delay) => {}
            _ = shared.skip.notified() => {
                debug!("cache refresh delay skipped");
            }
            _ = deps_changed(options.deps.as_ref(), deps_snapshot) => {
                debug!("cache dependency changed, refreshing early");
            }
        }
    }
}

/// Resolves when the dependency fingerprint diverges from the snapshot;
/// pends forever when no dependency check is configured
async fn deps_changed(deps: Option<&Deps>, snapshot: Option<String>) {
    let (deps, snapshot) = match (deps, snapshot) {
        (Some(deps), Some(snapshot)) => (deps, snapshot),
        _ => return std::future::pending().await,
    };
    let mut ticker = tokio::time::interval(deps.interval);
    ticker.tick().await; // first tick is immediate
    loop {
        ticker.tick().await;
        if (deps.handler)() != snapshot {
            return;
        }
    }
}
