//! Priority queue with visibility leases and dead letters.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use coord::CoordinationStore;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{Priority, QueueError, QueueMessage, QueueResult};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a delivered message stays invisible before it is reclaimed.
    pub visibility_timeout: Duration,
    /// Prefix for every key the queue writes.
    pub namespace: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { visibility_timeout: Duration::from_secs(300), namespace: "queue".into() }
    }
}

/// Result of a negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back on its queue with this retry count.
    Requeued(u32),
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub priority: Priority,
    pub depth: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
}

/// Durable priority work queue.
pub struct MessageQueue {
    store: Arc<dyn CoordinationStore>,
    config: QueueConfig,
    /// In-flight ids seen without a lease on the previous reaper sweep.
    suspects: Mutex<HashSet<Uuid>>,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, config: QueueConfig) -> Self {
        Self { store, config, suspects: Mutex::new(HashSet::new()) }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn pending_key(&self, priority: Priority) -> String {
        format!("{}:{}", self.config.namespace, priority)
    }

    fn processing_key(&self, priority: Priority) -> String {
        format!("{}:{}:processing", self.config.namespace, priority)
    }

    fn dead_key(&self, priority: Priority) -> String {
        format!("{}:{}:dead", self.config.namespace, priority)
    }

    fn body_key(&self, id: Uuid) -> String {
        format!("{}:msg:{}", self.config.namespace, id)
    }

    fn lease_key(&self, id: Uuid) -> String {
        format!("{}:lease:{}", self.config.namespace, id)
    }

    async fn load(&self, id: Uuid) -> QueueResult<Option<QueueMessage>> {
        Ok(coord::get_json(self.store.as_ref(), &self.body_key(id)).await?)
    }

    async fn save(&self, message: &QueueMessage) -> QueueResult<()> {
        Ok(coord::set_json(self.store.as_ref(), &self.body_key(message.id), message, None).await?)
    }

    /// Persist the message body, then append its id to the priority list.
    #[instrument(skip(self, message), fields(message_id = %message.id, queue = %message.priority))]
    pub async fn enqueue(&self, message: QueueMessage) -> QueueResult<Uuid> {
        self.save(&message).await?;
        self.store
            .push_back(&self.pending_key(message.priority), message.id.to_string().into_bytes())
            .await?;
        debug!("message enqueued");
        Ok(message.id)
    }

    /// Wait up to `wait` for the next message of `priority`. The message is
    /// invisible to other consumers until acked, nacked, or its lease expires.
    pub async fn dequeue(&self, priority: Priority, wait: Duration) -> QueueResult<Option<QueueMessage>> {
        let pending = self.pending_key(priority);
        let processing = self.processing_key(priority);

        loop {
            let Some(raw) = self.store.pop_move(&pending, &processing, wait).await? else {
                return Ok(None);
            };
            let Some(id) = parse_id(&raw) else {
                warn!(queue = %priority, "dropping malformed queue entry");
                self.store.list_remove(&processing, &raw).await?;
                continue;
            };

            self.store
                .set(&self.lease_key(id), priority.as_str().as_bytes().to_vec(), Some(self.config.visibility_timeout))
                .await?;

            let Some(mut message) = self.load(id).await? else {
                // Acked elsewhere after a reclaim; nothing left to deliver.
                self.store.list_remove(&processing, &raw).await?;
                self.store.delete(&self.lease_key(id)).await?;
                continue;
            };
            message.metadata.delivered_at = Some(Utc::now());
            self.save(&message).await?;
            debug!(message_id = %id, queue = %priority, "message delivered");
            return Ok(Some(message));
        }
    }

    /// Remove a delivered message for good. Returns `false` if it was unknown.
    pub async fn ack(&self, id: Uuid) -> QueueResult<bool> {
        let Some(message) = self.load(id).await? else {
            return Ok(false);
        };
        let raw = id.to_string().into_bytes();
        self.store.list_remove(&self.processing_key(message.priority), &raw).await?;
        self.store.delete(&self.lease_key(id)).await?;
        self.store.delete(&self.body_key(id)).await?;
        debug!(message_id = %id, "message acked");
        Ok(true)
    }

    /// Negative acknowledgement. With `requeue` and retries left the message
    /// goes back to the tail of its queue; otherwise it is dead-lettered.
    #[instrument(skip(self, error))]
    pub async fn nack(&self, id: Uuid, requeue: bool, error: Option<String>) -> QueueResult<NackOutcome> {
        let mut message = self.load(id).await?.ok_or(QueueError::UnknownMessage(id))?;
        let raw = id.to_string().into_bytes();
        let processing = self.processing_key(message.priority);

        if error.is_some() {
            message.metadata.last_error = error;
        }
        message.metadata.delivered_at = None;

        let outcome = if requeue && !message.retries_exhausted() {
            message.metadata.retry_count += 1;
            self.save(&message).await?;
            self.store.push_back(&self.pending_key(message.priority), raw.clone()).await?;
            NackOutcome::Requeued(message.metadata.retry_count)
        } else {
            self.save(&message).await?;
            self.store.push_back(&self.dead_key(message.priority), raw.clone()).await?;
            warn!(
                message_id = %id,
                retries = message.metadata.retry_count,
                error = ?message.metadata.last_error,
                "message dead-lettered"
            );
            NackOutcome::DeadLettered
        };

        self.store.list_remove(&processing, &raw).await?;
        self.store.delete(&self.lease_key(id)).await?;
        Ok(outcome)
    }

    /// Push the lease of a message still being worked on.
    pub async fn extend_visibility(&self, id: Uuid, priority: Priority) -> QueueResult<()> {
        self.store
            .set(&self.lease_key(id), priority.as_str().as_bytes().to_vec(), Some(self.config.visibility_timeout))
            .await?;
        Ok(())
    }

    /// Reclaim in-flight messages whose lease expired. An id must be seen
    /// without a lease on two consecutive sweeps, so a delivery that has not
    /// written its lease yet is left alone. Returns how many were reclaimed.
    pub async fn requeue_expired(&self) -> QueueResult<usize> {
        let mut lease_less = HashSet::new();
        let mut reclaimed = 0;

        for priority in Priority::ALL {
            for raw in self.store.list_range(&self.processing_key(priority)).await? {
                let Some(id) = parse_id(&raw) else { continue };
                if self.store.get(&self.lease_key(id)).await?.is_some() {
                    continue;
                }
                let seen_before = self.suspects.lock().map(|s| s.contains(&id)).unwrap_or(false);
                if !seen_before {
                    lease_less.insert(id);
                    continue;
                }
                match self.nack(id, true, Some("visibility timeout expired".into())).await {
                    Ok(_) => reclaimed += 1,
                    Err(QueueError::UnknownMessage(_)) => {
                        self.store.list_remove(&self.processing_key(priority), &raw).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Ok(mut suspects) = self.suspects.lock() {
            *suspects = lease_less;
        }
        if reclaimed > 0 {
            info!(reclaimed, "requeued messages with expired visibility");
        }
        Ok(reclaimed)
    }

    pub async fn dead_letters(&self, priority: Priority) -> QueueResult<Vec<QueueMessage>> {
        let mut out = Vec::new();
        for raw in self.store.list_range(&self.dead_key(priority)).await? {
            if let Some(message) = match parse_id(&raw) {
                Some(id) => self.load(id).await?,
                None => None,
            } {
                out.push(message);
            }
        }
        Ok(out)
    }

    /// Move a dead letter back onto its queue with a fresh retry budget.
    pub async fn replay_dead_letter(&self, id: Uuid) -> QueueResult<bool> {
        let Some(mut message) = self.load(id).await? else {
            return Ok(false);
        };
        let raw = id.to_string().into_bytes();
        if !self.store.list_remove(&self.dead_key(message.priority), &raw).await? {
            return Ok(false);
        }
        message.metadata.retry_count = 0;
        message.metadata.last_error = None;
        self.save(&message).await?;
        self.store.push_back(&self.pending_key(message.priority), raw).await?;
        info!(message_id = %id, "dead letter replayed");
        Ok(true)
    }

    pub async fn stats(&self) -> QueueResult<Vec<QueueStats>> {
        let mut out = Vec::with_capacity(Priority::ALL.len());
        for priority in Priority::ALL {
            out.push(QueueStats {
                priority,
                depth: self.store.list_len(&self.pending_key(priority)).await?,
                in_flight: self.store.list_len(&self.processing_key(priority)).await?,
                dead_letters: self.store.list_len(&self.dead_key(priority)).await?,
            });
        }
        Ok(out)
    }
}

fn parse_id(raw: &[u8]) -> Option<Uuid> {
    std::str::from_utf8(raw).ok().and_then(|s| Uuid::parse_str(s).ok())
}
