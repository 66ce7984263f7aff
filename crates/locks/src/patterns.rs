//! Coordination patterns derived from the lock: leader election and a
//! counting semaphore.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::handle::LockHandle;
use crate::manager::{lock_key, DistributedLock, Lock};
use crate::{LockError, LockResult};

/// Leadership over a named resource, held as an auto-renewed
/// `leader:<resource>` lock.
pub struct LeaderElection {
    manager: Arc<DistributedLock>,
    resource: String,
    ttl: Duration,
    handle: Option<LockHandle>,
}

impl LeaderElection {
    pub fn new(manager: Arc<DistributedLock>, resource: impl Into<String>, ttl: Duration) -> Self {
        Self { manager, resource: resource.into(), ttl, handle: None }
    }

    fn lock_name(&self) -> String {
        format!("leader:{}", self.resource)
    }

    /// Try once to become leader. Returns whether this instance leads now.
    pub async fn campaign(&mut self) -> LockResult<bool> {
        if self.is_leader() {
            return Ok(true);
        }
        match self.manager.try_acquire(&self.lock_name(), self.ttl).await? {
            Some(lock) => {
                info!(resource = %self.resource, "became leader");
                self.handle = Some(LockHandle::start(self.manager.clone(), lock));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Leadership holds while the renewal task keeps succeeding.
    pub fn is_leader(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_lost())
    }

    pub async fn step_down(&mut self) -> LockResult<()> {
        if let Some(handle) = self.handle.take() {
            handle.release().await?;
            info!(resource = %self.resource, "stepped down");
        }
        Ok(())
    }
}

/// A permit from [`DistributedSemaphore`]; release it with
/// [`DistributedSemaphore::release`].
#[derive(Debug, Clone)]
pub struct SemaphorePermit {
    pub slot: u32,
    pub lock: Lock,
}

/// Counting semaphore built from `permits` independently locked slots
/// (`semaphore:<name>:<slot>`).
pub struct DistributedSemaphore {
    manager: Arc<DistributedLock>,
    name: String,
    permits: u32,
    ttl: Duration,
}

impl DistributedSemaphore {
    pub fn new(manager: Arc<DistributedLock>, name: impl Into<String>, permits: u32, ttl: Duration) -> Self {
        Self { manager, name: name.into(), permits, ttl }
    }

    fn slot_name(&self, slot: u32) -> String {
        format!("semaphore:{}:{}", self.name, slot)
    }

    fn shuffled_slots(&self) -> Vec<u32> {
        let mut slots: Vec<u32> = (0..self.permits).collect();
        slots.shuffle(&mut rand::thread_rng());
        slots
    }

    /// One pass over the slots in random order.
    pub async fn try_acquire(&self) -> LockResult<Option<SemaphorePermit>> {
        for slot in self.shuffled_slots() {
            if let Some(lock) = self.manager.try_acquire(&self.slot_name(slot), self.ttl).await? {
                debug!(semaphore = %self.name, slot, "permit acquired");
                return Ok(Some(SemaphorePermit { slot, lock }));
            }
        }
        Ok(None)
    }

    /// Retry passes with the lock manager's backoff settings.
    pub async fn acquire(&self) -> LockResult<SemaphorePermit> {
        let config = self.manager.config();
        let attempts = config.retry_count + 1;
        for attempt in 1..=attempts {
            if let Some(permit) = self.try_acquire().await? {
                return Ok(permit);
            }
            if attempt < attempts {
                tokio::time::sleep(config.retry_delay).await;
            }
        }
        Err(LockError::Contended { resource: self.name.clone(), attempts })
    }

    pub async fn release(&self, permit: &SemaphorePermit) -> LockResult<bool> {
        self.manager.release(&permit.lock).await
    }

    /// Slots not currently held by anyone.
    pub async fn available(&self) -> LockResult<u32> {
        let mut free = 0;
        for slot in 0..self.permits {
            if !self.manager.is_locked(&self.slot_name(slot)).await? {
                free += 1;
            }
        }
        Ok(free)
    }

    /// Store key backing a slot, exposed for diagnostics.
    pub fn slot_key(&self, slot: u32) -> String {
        lock_key(&self.slot_name(slot))
    }
}
