//! Resource manager.
//!
//! Process-local ledger of live objects that need cleanup: in-flight
//! executions (whose cleanup releases the execution lock) and borrowed storage
//! connections. Every acquisition goes through [`ResourceManager::guard`]; the
//! returned [`ResourceGuard`] unregisters on every exit path, including drop
//! during unwinding or task abort.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Deferred release action, run at most once.
pub type Cleanup = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Execution,
    Connection,
}

struct Entry {
    kind: ResourceKind,
    owner: Option<Uuid>,
    last_used: Instant,
    cleanup: Option<Cleanup>,
}

/// An entry nobody touched for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleResource {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub owner: Option<Uuid>,
    pub idle: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    pub executions: usize,
    pub connections: usize,
}

pub struct ResourceManager {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a resource. `cleanup` runs on release or shutdown, never on `unregister`.
    pub fn register(&self, kind: ResourceKind, owner: Option<Uuid>, cleanup: Option<Cleanup>) -> Uuid {
        let id = Uuid::new_v4();
        self.entries().insert(id, Entry { kind, owner, last_used: Instant::now(), cleanup });
        debug!(resource_id = %id, ?kind, "resource registered");
        id
    }

    /// Register and wrap in a guard that releases on drop.
    pub fn guard(self: &Arc<Self>, kind: ResourceKind, owner: Option<Uuid>, cleanup: Option<Cleanup>) -> ResourceGuard {
        let id = self.register(kind, owner, cleanup);
        ResourceGuard { manager: self.clone(), id, done: false }
    }

    /// Forget a resource whose owner already cleaned it up.
    pub fn unregister(&self, id: Uuid) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Unregister and run the cleanup action, if any.
    pub async fn release(&self, id: Uuid) -> bool {
        let entry = self.entries().remove(&id);
        match entry {
            Some(entry) => {
                if let Some(cleanup) = entry.cleanup {
                    cleanup.await;
                }
                true
            }
            None => false,
        }
    }

    /// Release every resource owned by `owner`.
    pub async fn release_owner(&self, owner: Uuid) -> usize {
        let cleanups: Vec<Option<Cleanup>> = {
            let mut entries = self.entries();
            let ids: Vec<Uuid> = entries.iter().filter(|(_, e)| e.owner == Some(owner)).map(|(id, _)| *id).collect();
            ids.iter().filter_map(|id| entries.remove(id)).map(|e| e.cleanup).collect()
        };
        let released = cleanups.len();
        for cleanup in cleanups.into_iter().flatten() {
            cleanup.await;
        }
        released
    }

    /// Refresh last-used time.
    pub fn touch(&self, id: Uuid) -> bool {
        match self.entries().get_mut(&id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Resources not touched for at least `threshold`.
    pub fn idle_for(&self, threshold: Duration) -> Vec<IdleResource> {
        let now = Instant::now();
        self.entries()
            .iter()
            .map(|(id, e)| IdleResource { id: *id, kind: e.kind, owner: e.owner, idle: now.duration_since(e.last_used) })
            .filter(|r| r.idle >= threshold)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> ResourceCounts {
        let mut counts = ResourceCounts::default();
        for entry in self.entries().values() {
            match entry.kind {
                ResourceKind::Execution => counts.executions += 1,
                ResourceKind::Connection => counts.connections += 1,
            }
        }
        counts
    }

    /// Force-release everything still registered. Each cleanup gets `per_cleanup`
    /// before it is abandoned. Returns how many entries were released.
    pub async fn shutdown(&self, per_cleanup: Duration) -> usize {
        let drained: Vec<(Uuid, Entry)> = self.entries().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            if let Some(cleanup) = entry.cleanup {
                if tokio::time::timeout(per_cleanup, cleanup).await.is_err() {
                    warn!(resource_id = %id, kind = ?entry.kind, "cleanup timed out during shutdown");
                }
            }
        }
        count
    }
}

// ---------------------------------------------------------------------------
// ResourceGuard
// ---------------------------------------------------------------------------

/// Registered resource that unregisters itself when it goes out of scope.
#[must_use = "dropping the guard releases the resource immediately"]
pub struct ResourceGuard {
    manager: Arc<ResourceManager>,
    id: Uuid,
    done: bool,
}

impl ResourceGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the cleanup now and wait for it.
    pub async fn release(mut self) {
        self.done = true;
        self.manager.release(self.id).await;
    }

    /// Unregister without running the cleanup.
    pub fn complete(mut self) {
        self.done = true;
        self.manager.unregister(self.id);
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let entry = self.manager.entries().remove(&self.id);
        if let Some(cleanup) = entry.and_then(|e| e.cleanup) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    warn!(resource_id = %self.id, "resource dropped without release, cleaning up in background");
                    handle.spawn(cleanup);
                }
                Err(_) => warn!(resource_id = %self.id, "resource dropped outside a runtime, cleanup skipped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Option<Cleanup> {
        let counter = counter.clone();
        Some(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn release_runs_cleanup_once() {
        let manager = Arc::new(ResourceManager::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let guard = manager.guard(ResourceKind::Execution, None, counting(&ran));
        assert_eq!(manager.counts().executions, 1);

        guard.release().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn complete_skips_cleanup() {
        let manager = Arc::new(ResourceManager::new());
        let ran = Arc::new(AtomicUsize::new(0));
        manager.guard(ResourceKind::Connection, None, counting(&ran)).complete();
        assert!(manager.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_guard_still_cleans_up() {
        let manager = Arc::new(ResourceManager::new());
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let _guard = manager.guard(ResourceKind::Execution, None, counting(&ran));
        }
        assert!(manager.is_empty());
        // Cleanup was spawned; let it run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_owner_only_touches_that_owner() {
        let manager = ResourceManager::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let owner = Uuid::new_v4();
        manager.register(ResourceKind::Execution, Some(owner), counting(&ran));
        manager.register(ResourceKind::Connection, Some(owner), None);
        manager.register(ResourceKind::Execution, Some(Uuid::new_v4()), counting(&ran));

        assert_eq!(manager.release_owner(owner).await, 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_clock() {
        let manager = ResourceManager::new();
        let a = manager.register(ResourceKind::Connection, None, None);
        let b = manager.register(ResourceKind::Connection, None, None);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(manager.touch(a));
        let idle = manager.idle_for(Duration::from_secs(20));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, b);
        assert_eq!(idle[0].kind, ResourceKind::Connection);
        assert_eq!(idle[0].idle, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_bounds_each_cleanup() {
        let manager = ResourceManager::new();
        let ran = Arc::new(AtomicUsize::new(0));
        manager.register(ResourceKind::Execution, None, counting(&ran));
        manager.register(
            ResourceKind::Execution,
            None,
            Some(Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })),
        );

        assert_eq!(manager.shutdown(Duration::from_secs(1)).await, 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }
}
