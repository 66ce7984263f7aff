//! Auto-renewing lock handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::manager::{DistributedLock, Lock};
use crate::LockResult;

/// A held lock whose TTL is extended every `ttl / 3` by a background task.
///
/// If an extension fails the task stops, and [`lost`](Self::lost) resolves
/// with the reason. Dropping the handle stops renewal; the lock then lapses
/// at its TTL unless [`release`](Self::release) was called.
pub struct LockHandle {
    manager: Arc<DistributedLock>,
    current: Arc<Mutex<Lock>>,
    lost_rx: watch::Receiver<Option<String>>,
    renewal: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub(crate) fn start(manager: Arc<DistributedLock>, lock: Lock) -> Self {
        let interval = (lock.ttl / 3).max(Duration::from_millis(10));
        let current = Arc::new(Mutex::new(lock));
        let (lost_tx, lost_rx) = watch::channel(None);

        let renewal = {
            let manager = manager.clone();
            let current = current.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let snapshot = match current.lock() {
                        Ok(guard) => guard.clone(),
                        Err(poisoned) => poisoned.into_inner().clone(),
                    };
                    match manager.extend(&snapshot, snapshot.ttl).await {
                        Ok(renewed) => {
                            debug!(resource = %renewed.resource, "lock renewed");
                            if let Ok(mut guard) = current.lock() {
                                *guard = renewed;
                            }
                        }
                        Err(e) => {
                            warn!(resource = %snapshot.resource, error = %e, "lock renewal failed");
                            let _ = lost_tx.send(Some(e.to_string()));
                            break;
                        }
                    }
                }
            })
        };

        Self { manager, current, lost_rx, renewal: Some(renewal) }
    }

    /// The most recently confirmed lock.
    pub fn lock(&self) -> Lock {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost_rx.borrow().is_some()
    }

    /// Resolves once renewal has failed, yielding the failure reason.
    /// Pends forever while the lock is healthy.
    pub async fn lost(&mut self) -> String {
        loop {
            if let Some(reason) = self.lost_rx.borrow_and_update().clone() {
                return reason;
            }
            if self.lost_rx.changed().await.is_err() {
                // Renewal task ended without reporting a loss (aborted by release).
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stop renewing and release the lock.
    pub async fn release(mut self) -> LockResult<bool> {
        if let Some(task) = self.renewal.take() {
            task.abort();
        }
        let lock = self.lock();
        self.manager.release(&lock).await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(task) = self.renewal.take() {
            task.abort();
        }
    }
}
