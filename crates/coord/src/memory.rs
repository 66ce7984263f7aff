//! In-memory coordination store.
//!
//! Single-process reference implementation of [`CoordinationStore`]. All
//! operations take one async mutex, which makes compare-and-swap and
//! pop-and-move trivially indivisible. Expired keys are dropped lazily on
//! access and by [`MemoryStore::purge_expired`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{CoordResult, CoordinationStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
}

impl Inner {
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        if self.values.get(key).is_some_and(|e| e.is_expired(now)) {
            self.values.remove(key);
        }
        self.values.get(key)
    }
}

/// HashMap-backed store shared by cloning.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.values.len();
        inner.values.retain(|_, e| !e.is_expired(now));
        before - inner.values.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> CoordResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CoordResult<()> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.inner
            .lock()
            .await
            .values
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoordResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner.values.remove(key).is_some_and(|e| !e.is_expired(now)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> CoordResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let current = inner.live(key, now).map(|e| e.value.as_slice());
        if current != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                inner.values.insert(
                    key.to_owned(),
                    Entry { value, expires_at: ttl.map(|t| now + t) },
                );
            }
            None => {
                inner.values.remove(key);
            }
        }
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> CoordResult<Option<Duration>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|exp| exp.saturating_duration_since(now)))
    }

    async fn keys(&self, prefix: &str) -> CoordResult<Vec<String>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner
            .values
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn push_back(&self, list: &str, value: Vec<u8>) -> CoordResult<usize> {
        let len = {
            let mut inner = self.inner.lock().await;
            let entries = inner.lists.entry(list.to_owned()).or_default();
            entries.push_back(value);
            entries.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn pop_move(&self, src: &str, dst: &str, wait: Duration) -> CoordResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                let popped = inner.lists.get_mut(src).and_then(VecDeque::pop_front);
                if inner.lists.get(src).is_some_and(VecDeque::is_empty) {
                    inner.lists.remove(src);
                }
                if let Some(value) = popped {
                    inner
                        .lists
                        .entry(dst.to_owned())
                        .or_default()
                        .push_back(value.clone());
                    return Ok(Some(value));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_remove(&self, list: &str, value: &[u8]) -> CoordResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(entries) = inner.lists.get_mut(list) else {
            return Ok(false);
        };
        let removed = match entries.iter().position(|v| v.as_slice() == value) {
            Some(pos) => entries.remove(pos).is_some(),
            None => false,
        };
        if entries.is_empty() {
            inner.lists.remove(list);
        }
        Ok(removed)
    }

    async fn list_range(&self, list: &str) -> CoordResult<Vec<Vec<u8>>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(list)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, list: &str) -> CoordResult<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(list).map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_from_absent_succeeds_once() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("k", None, Some(b"a".to_vec()), None).await.unwrap());
        assert!(!store.compare_and_swap("k", None, Some(b"b".to_vec()), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn cas_with_none_deletes_only_on_match() {
        let store = MemoryStore::new();
        store.set("k", b"token".to_vec(), None).await.unwrap();

        assert!(!store.compare_and_swap("k", Some(b"other"), None, None).await.unwrap());
        assert!(store.compare_and_swap("k", Some(b"token"), None, None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_makes_key_absent() {
        let store = MemoryStore::new();
        store.set("lease", b"x".to_vec(), Some(Duration::from_secs(5))).await.unwrap();
        assert!(store.ttl("lease").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("lease").await.unwrap(), None);
        // An expired key counts as absent for compare-and-swap.
        assert!(store.compare_and_swap("lease", None, Some(b"y".to_vec()), None).await.unwrap());
    }

    #[tokio::test]
    async fn pop_move_transfers_head_fifo() {
        let store = MemoryStore::new();
        store.push_back("q", b"1".to_vec()).await.unwrap();
        store.push_back("q", b"2".to_vec()).await.unwrap();

        let first = store.pop_move("q", "p", Duration::ZERO).await.unwrap();
        assert_eq!(first, Some(b"1".to_vec()));
        assert_eq!(store.list_len("q").await.unwrap(), 1);
        assert_eq!(store.list_range("p").await.unwrap(), vec![b"1".to_vec()]);
    }

    #[tokio::test]
    async fn pop_move_wakes_on_push() {
        let store = MemoryStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.pop_move("q", "p", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        store.push_back("q", b"late".to_vec()).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, Some(b"late".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_move_times_out_on_empty_list() {
        let store = MemoryStore::new();
        let got = store.pop_move("q", "p", Duration::from_millis(200)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn list_remove_only_removes_present_values() {
        let store = MemoryStore::new();
        store.push_back("l", b"a".to_vec()).await.unwrap();
        assert!(store.list_remove("l", b"a").await.unwrap());
        assert!(!store.list_remove("l", b"a").await.unwrap());
    }
}
