//! Quorum lock over one or more coordination-store replicas.
//!
//! Acquisition writes a fresh random token to every replica with a
//! compare-and-swap from "absent". The lock is granted only when a strict
//! majority accepted the write and enough of the TTL is left after
//! subtracting the time spent and a clock-drift allowance. Partial writes
//! from a failed attempt are rolled back before retrying.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coord::CoordinationStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::handle::LockHandle;
use crate::{LockError, LockResult};

/// Tuning knobs for [`DistributedLock`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Extra attempts after the first one.
    pub retry_count: u32,
    /// Base delay between attempts.
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to `retry_delay`.
    pub retry_jitter: Duration,
    /// Fraction of the TTL reserved for clock drift between replicas.
    pub drift_factor: f64,
    /// Per-replica deadline for a single write.
    pub store_timeout: Duration,
    /// Locks with at least this TTL are auto-extended by `with_lock`.
    pub auto_extend_min_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(100),
            drift_factor: 0.01,
            store_timeout: Duration::from_millis(250),
            auto_extend_min_ttl: Duration::from_secs(10),
        }
    }
}

/// A granted lock. The token is what proves ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource: String,
    pub token: String,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    /// Rebuild a lock from a resource name and token carried elsewhere
    /// (for example inside a queue message).
    pub fn from_parts(resource: impl Into<String>, token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            resource: resource.into(),
            token: token.into(),
            ttl,
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Store key for a lock resource.
pub(crate) fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

fn new_token() -> String {
    let bytes: [u8; 20] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Quorum-based distributed lock manager.
pub struct DistributedLock {
    stores: Vec<Arc<dyn CoordinationStore>>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(stores: Vec<Arc<dyn CoordinationStore>>, config: LockConfig) -> LockResult<Self> {
        if stores.is_empty() {
            return Err(LockError::NoStores);
        }
        Ok(Self { stores, config })
    }

    /// Convenience constructor for a single replica (quorum of one).
    pub fn single(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Self {
        Self { stores: vec![store], config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    /// Acquire with the configured retry count.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> LockResult<Lock> {
        self.acquire_with_retries(resource, ttl, self.config.retry_count).await
    }

    /// Acquire, retrying with jittered backoff up to `retries` extra times.
    #[instrument(skip(self), fields(quorum = self.quorum()))]
    pub async fn acquire_with_retries(
        &self,
        resource: &str,
        ttl: Duration,
        retries: u32,
    ) -> LockResult<Lock> {
        let attempts = retries + 1;
        for attempt in 1..=attempts {
            if let Some(lock) = self.attempt(resource, ttl).await? {
                debug!(attempt, "lock acquired");
                return Ok(lock);
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff()).await;
            }
        }
        Err(LockError::Contended { resource: resource.to_owned(), attempts })
    }

    /// Single non-blocking attempt. `Ok(None)` means someone else holds it.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> LockResult<Option<Lock>> {
        self.attempt(resource, ttl).await
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.retry_delay + Duration::from_millis(extra)
    }

    async fn attempt(&self, resource: &str, ttl: Duration) -> LockResult<Option<Lock>> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }

        let key = lock_key(resource);
        let token = new_token();
        let started = Instant::now();

        let mut granted = 0usize;
        for store in &self.stores {
            let write = store.compare_and_swap(&key, None, Some(token.as_bytes().to_vec()), Some(ttl));
            match tokio::time::timeout(self.config.store_timeout, write).await {
                Ok(Ok(true)) => granted += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(resource, error = %e, "replica rejected lock write"),
                Err(_) => debug!(resource, "replica lock write timed out"),
            }
        }

        let drift = ttl.mul_f64(self.config.drift_factor) + Duration::from_millis(2);
        let validity = ttl.checked_sub(started.elapsed() + drift).unwrap_or_default();

        if granted >= self.quorum() && !validity.is_zero() {
            let expires_at = Utc::now() + chrono::Duration::from_std(validity).unwrap_or_default();
            return Ok(Some(Lock { resource: resource.to_owned(), token, ttl, expires_at }));
        }

        if granted > 0 {
            self.unlock_replicas(&key, &token).await;
        }
        Ok(None)
    }

    /// Remove the token from every replica that still holds it.
    async fn unlock_replicas(&self, key: &str, token: &str) -> usize {
        let mut released = 0;
        for store in &self.stores {
            let delete = store.compare_and_swap(key, Some(token.as_bytes()), None, None);
            match tokio::time::timeout(self.config.store_timeout, delete).await {
                Ok(Ok(true)) => released += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(key, error = %e, "replica unlock failed"),
                Err(_) => warn!(key, "replica unlock timed out"),
            }
        }
        released
    }

    /// Release a lock. Returns `false` when the token no longer matched on a
    /// majority of replicas (it expired and may belong to someone else now).
    pub async fn release(&self, lock: &Lock) -> LockResult<bool> {
        let released = self.unlock_replicas(&lock_key(&lock.resource), &lock.token).await;
        let ok = released >= self.quorum();
        if !ok {
            debug!(resource = %lock.resource, released, "release did not reach quorum");
        }
        Ok(ok)
    }

    /// Push the expiry of a held lock forward by `ttl`.
    pub async fn extend(&self, lock: &Lock, ttl: Duration) -> LockResult<Lock> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        let key = lock_key(&lock.resource);
        let token = lock.token.as_bytes();
        let started = Instant::now();

        let mut extended = 0usize;
        for store in &self.stores {
            let write = store.compare_and_swap(&key, Some(token), Some(token.to_vec()), Some(ttl));
            if let Ok(Ok(true)) = tokio::time::timeout(self.config.store_timeout, write).await {
                extended += 1;
            }
        }

        let drift = ttl.mul_f64(self.config.drift_factor) + Duration::from_millis(2);
        let validity = ttl.checked_sub(started.elapsed() + drift).unwrap_or_default();
        if extended < self.quorum() || validity.is_zero() {
            return Err(LockError::NotHeld(lock.resource.clone()));
        }

        Ok(Lock {
            resource: lock.resource.clone(),
            token: lock.token.clone(),
            ttl,
            expires_at: Utc::now() + chrono::Duration::from_std(validity).unwrap_or_default(),
        })
    }

    /// Acquire and keep the lock alive in the background at a third of its TTL.
    pub async fn acquire_with_renewal(
        self: &Arc<Self>,
        resource: &str,
        ttl: Duration,
    ) -> LockResult<LockHandle> {
        let lock = self.acquire(resource, ttl).await?;
        Ok(LockHandle::start(self.clone(), lock))
    }

    /// Run `f` while holding `resource`.
    ///
    /// Long TTLs are renewed in the background; if a renewal fails the
    /// future is dropped and [`LockError::Lost`] is returned instead of
    /// letting `f` run on without the lock.
    pub async fn with_lock<F, Fut, T>(self: &Arc<Self>, resource: &str, ttl: Duration, f: F) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if ttl < self.config.auto_extend_min_ttl {
            let lock = self.acquire(resource, ttl).await?;
            let out = f().await;
            if !self.release(&lock).await? {
                warn!(resource, "lock expired before with_lock finished");
            }
            return Ok(out);
        }

        let mut handle = self.acquire_with_renewal(resource, ttl).await?;
        let outcome = tokio::select! {
            out = f() => Ok(out),
            reason = handle.lost() => Err(LockError::Lost { resource: resource.to_owned(), reason }),
        };
        if let Err(e) = handle.release().await {
            warn!(resource, error = %e, "failed to release renewed lock");
        }
        if let Err(LockError::Lost { reason, .. }) = &outcome {
            info!(resource, reason, "with_lock aborted after losing the lock");
        }
        outcome
    }

    /// Whether a majority of replicas currently hold some token for `resource`.
    pub async fn is_locked(&self, resource: &str) -> LockResult<bool> {
        let key = lock_key(resource);
        let mut held = 0;
        for store in &self.stores {
            if store.get(&key).await?.is_some() {
                held += 1;
            }
        }
        Ok(held >= self.quorum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord::MemoryStore;

    fn fast_config(retries: u32) -> LockConfig {
        LockConfig {
            retry_count: retries,
            retry_delay: Duration::from_millis(5),
            retry_jitter: Duration::from_millis(5),
            ..LockConfig::default()
        }
    }

    fn manager(retries: u32) -> DistributedLock {
        DistributedLock::single(Arc::new(MemoryStore::new()), fast_config(retries))
    }

    #[tokio::test]
    async fn second_acquire_is_blocked_until_release() {
        let locks = manager(0);
        let first = locks.acquire("report", Duration::from_secs(30)).await.unwrap();

        let second = locks.acquire("report", Duration::from_secs(30)).await;
        assert!(matches!(second, Err(LockError::Contended { attempts: 1, .. })));

        assert!(locks.release(&first).await.unwrap());
        let second = locks.acquire("report", Duration::from_secs(30)).await.unwrap();
        assert_ne!(second.token, first.token);
    }

    #[tokio::test]
    async fn concurrent_acquires_grant_exactly_one() {
        let locks = Arc::new(manager(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("shared", Duration::from_secs(30)).await.is_ok()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_frees_a_crashed_holder() {
        let locks = manager(0);
        let _abandoned = locks.acquire("job", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(locks.acquire("job", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_new_holder() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let locks = DistributedLock::single(store.clone(), fast_config(0));

        let old = locks.acquire("res", Duration::from_secs(30)).await.unwrap();
        // Simulate expiry followed by another process taking the lock.
        store.delete("lock:res").await.unwrap();
        let current = locks.acquire("res", Duration::from_secs(30)).await.unwrap();

        assert!(!locks.release(&old).await.unwrap());
        assert!(locks.is_locked("res").await.unwrap());
        assert!(locks.release(&current).await.unwrap());
    }

    #[tokio::test]
    async fn quorum_requires_majority_of_replicas() {
        let stores: Vec<Arc<dyn CoordinationStore>> = (0..3)
            .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn CoordinationStore>)
            .collect();
        // Another holder owns the key on two of three replicas.
        for store in &stores[..2] {
            store
                .set("lock:res", b"foreign".to_vec(), Some(Duration::from_secs(30)))
                .await
                .unwrap();
        }
        let locks = DistributedLock::new(stores.clone(), fast_config(0)).unwrap();

        assert!(locks.try_acquire("res", Duration::from_secs(10)).await.unwrap().is_none());
        // The partial write on the free replica was rolled back.
        assert_eq!(stores[2].get("lock:res").await.unwrap(), None);

        stores[0].delete("lock:res").await.unwrap();
        assert!(locks.try_acquire("res", Duration::from_secs(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn extend_requires_matching_token() {
        let locks = manager(0);
        let lock = locks.acquire("res", Duration::from_secs(5)).await.unwrap();

        let extended = locks.extend(&lock, Duration::from_secs(60)).await.unwrap();
        assert_eq!(extended.token, lock.token);
        assert!(extended.expires_at > lock.expires_at);

        let forged = Lock::from_parts("res", "forged", Duration::from_secs(5));
        assert!(matches!(
            locks.extend(&forged, Duration::from_secs(60)).await,
            Err(LockError::NotHeld(_))
        ));
    }

    #[tokio::test]
    async fn with_lock_runs_closure_and_releases() {
        let locks = Arc::new(manager(0));
        let value = locks
            .with_lock("critical", Duration::from_secs(2), || async { 41 + 1 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(!locks.is_locked("critical").await.unwrap());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let locks = manager(0);
        assert!(matches!(
            locks.acquire("res", Duration::ZERO).await,
            Err(LockError::InvalidTtl)
        ));
    }
}
