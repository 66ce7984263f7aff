//! `coord` crate: the shared coordination-store contract.
//!
//! Every cross-process primitive in the workspace (locks, circuit breakers,
//! the message queue) is written against [`CoordinationStore`].  The store
//! offers three families of operations:
//!
//! - key/value with per-key TTL,
//! - an indivisible compare-and-swap (the only way shared state is mutated),
//! - list primitives, including a blocking pop-and-move used for queues.
//!
//! [`MemoryStore`] is the in-process reference implementation used by tests
//! and single-node deployments.

pub mod error;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

pub use error::{CoordError, CoordResult};
pub use memory::MemoryStore;

/// Contract every coordination backend must fulfil.
///
/// Implementations must make [`compare_and_swap`](Self::compare_and_swap) and
/// [`pop_move`](Self::pop_move) indivisible with respect to every other caller,
/// in this process or any other.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key. Expired keys read as `None`.
    async fn get(&self, key: &str) -> CoordResult<Option<Vec<u8>>>;

    /// Unconditionally write a key, optionally with a time-to-live.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CoordResult<()>;

    /// Delete a key. Returns `true` if a live key was removed.
    async fn delete(&self, key: &str) -> CoordResult<bool>;

    /// Atomic conditional update.
    ///
    /// If the current value equals `expected` (`None` meaning "absent or
    /// expired"), replace it with `new` (`None` meaning delete) and the given
    /// TTL, and return `true`. Otherwise leave it untouched and return `false`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> CoordResult<bool>;

    /// Remaining time-to-live of a live key, `None` if absent or persistent.
    async fn ttl(&self, key: &str) -> CoordResult<Option<Duration>>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> CoordResult<Vec<String>>;

    /// Append to the tail of a list, returning the new length.
    async fn push_back(&self, list: &str, value: Vec<u8>) -> CoordResult<usize>;

    /// Pop the head of `src` and append it to `dst` in one step, waiting up
    /// to `wait` for an element to appear.
    async fn pop_move(&self, src: &str, dst: &str, wait: Duration) -> CoordResult<Option<Vec<u8>>>;

    /// Remove the first occurrence of `value` from a list.
    async fn list_remove(&self, list: &str, value: &[u8]) -> CoordResult<bool>;

    /// Snapshot of a list, head first.
    async fn list_range(&self, list: &str) -> CoordResult<Vec<Vec<u8>>>;

    /// Number of elements in a list.
    async fn list_len(&self, list: &str) -> CoordResult<usize>;
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> CoordResult<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T: Serialize>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CoordResult<()> {
    store.set(key, serde_json::to_vec(value)?, ttl).await
}

/// Decision returned by the closure passed to [`atomic_update`].
#[derive(Debug)]
pub enum Update<T> {
    /// Write this value (compare-and-swap against what was read).
    Set(T),
    /// Leave the stored value as it is.
    Keep,
}

/// Outcome of [`atomic_update`].
#[derive(Debug, Clone, PartialEq)]
pub struct Updated<T> {
    /// The value now stored (the new one if applied, the observed one otherwise).
    pub value: Option<T>,
    /// Whether the closure asked for a write and the write landed.
    pub applied: bool,
}

/// Optimistic read-modify-write over a JSON value.
///
/// Reads the key, hands the decoded value to `decide`, and compare-and-swaps
/// the result against the exact bytes that were read. On conflict the loop
/// re-reads and asks `decide` again, up to `max_attempts` times.
pub async fn atomic_update<T, F>(
    store: &dyn CoordinationStore,
    key: &str,
    ttl: Option<Duration>,
    max_attempts: u32,
    mut decide: F,
) -> CoordResult<Updated<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<&T>) -> Update<T>,
{
    for _ in 0..max_attempts.max(1) {
        let raw = store.get(key).await?;
        let current: Option<T> = match &raw {
            Some(bytes) => Some(serde_json::from_slice(bytes)?),
            None => None,
        };

        match decide(current.as_ref()) {
            Update::Keep => {
                return Ok(Updated { value: current, applied: false });
            }
            Update::Set(next) => {
                let encoded = serde_json::to_vec(&next)?;
                if store
                    .compare_and_swap(key, raw.as_deref(), Some(encoded), ttl)
                    .await?
                {
                    return Ok(Updated { value: Some(next), applied: true });
                }
                tracing::debug!(key, "atomic update conflict, retrying");
            }
        }
    }

    Err(CoordError::Contention {
        key: key.to_owned(),
        attempts: max_attempts.max(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        n: u32,
    }

    #[tokio::test]
    async fn json_helpers_round_trip_through_the_store() {
        let store = MemoryStore::new();
        set_json(&store, "c", &Counter { n: 7 }, None).await.unwrap();
        let back: Option<Counter> = get_json(&store, "c").await.unwrap();
        assert_eq!(back, Some(Counter { n: 7 }));
    }

    #[tokio::test]
    async fn atomic_update_keep_leaves_value_untouched() {
        let store = MemoryStore::new();
        set_json(&store, "c", &Counter { n: 1 }, None).await.unwrap();

        let out = atomic_update::<Counter, _>(&store, "c", None, 3, |_| Update::Keep)
            .await
            .unwrap();
        assert!(!out.applied);
        assert_eq!(out.value, Some(Counter { n: 1 }));
    }

    #[tokio::test]
    async fn concurrent_atomic_updates_do_not_lose_increments() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                atomic_update::<Counter, _>(store.as_ref(), "c", None, 100, |cur| {
                    Update::Set(Counter { n: cur.map_or(0, |c| c.n) + 1 })
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let total: Option<Counter> = get_json(store.as_ref(), "c").await.unwrap();
        assert_eq!(total, Some(Counter { n: 20 }));
    }
}
