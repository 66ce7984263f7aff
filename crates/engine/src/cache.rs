//! Workflow cache: definitions by id and step results by content hash.
//!
//! Process-local and advisory. Durable storage stays authoritative, so a miss
//! or a stale eviction only costs a storage read or an agent call.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::{WorkflowDefinition, WorkflowStep};

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Insertion order, oldest first, for eviction when full.
    order: VecDeque<K>,
}

/// Bounded TTL map with FIFO eviction.
pub struct TtlCache<K, V> {
    max_size: usize,
    ttl: Duration,
    inner: RwLock<CacheInner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            inner: RwLock::new(CacheInner { entries: HashMap::new(), order: VecDeque::new() }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        {
            let inner = self.inner.read().await;
            if let Some(entry) = inner.entries.get(key) {
                if Instant::now() < entry.expires_at {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.write().await;
        let expires_at = Instant::now() + self.ttl;
        if inner.entries.insert(key.clone(), CacheEntry { value, expires_at }).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.max_size {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub async fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.entries.remove(key).is_some();
        if removed {
            inner.order.retain(|k| k != key);
        }
        removed
    }

    /// Drop expired entries; returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| now < e.expires_at);
        let CacheInner { entries, order } = &mut *inner;
        order.retain(|k| entries.contains_key(k));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// WorkflowCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub definitions: usize,
    pub results: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct WorkflowCache {
    definitions: TtlCache<Uuid, Arc<WorkflowDefinition>>,
    results: TtlCache<String, Value>,
}

impl WorkflowCache {
    pub fn new(max_entries: usize, definition_ttl: Duration, result_ttl: Duration) -> Self {
        Self {
            definitions: TtlCache::new(max_entries, definition_ttl),
            results: TtlCache::new(max_entries, result_ttl),
        }
    }

    /// Latest cached version of a definition.
    pub async fn definition(&self, id: Uuid) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(&id).await
    }

    pub async fn put_definition(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let definition = Arc::new(definition);
        self.definitions.insert(definition.id, definition.clone()).await;
        definition
    }

    pub async fn invalidate_definition(&self, id: Uuid) -> bool {
        self.definitions.remove(&id).await
    }

    pub async fn result(&self, key: &str) -> Option<Value> {
        self.results.get(&key.to_string()).await
    }

    pub async fn put_result(&self, key: String, output: Value) {
        self.results.insert(key, output).await;
    }

    /// Content hash of everything that determines a step's output.
    pub fn result_key(step: &WorkflowStep, input: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(step.agent_type.as_bytes());
        hasher.update([0]);
        hasher.update(step.config.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(input.to_string().as_bytes());
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }

    pub async fn purge_expired(&self) -> usize {
        self.definitions.purge_expired().await + self.results.purge_expired().await
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            definitions: self.definitions.len().await,
            results: self.results.len().await,
            hits: self.definitions.hits() + self.results.hits(),
            misses: self.definitions.misses() + self.results.misses(),
        }
    }
}
