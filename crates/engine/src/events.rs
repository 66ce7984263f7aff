//! Lifecycle events on a broadcast channel.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use queue::Priority;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowRegistered { workflow_id: Uuid, version: u32 },
    WorkflowQueued { execution_id: Uuid, workflow_id: Uuid, priority: Priority },
    ExecutionStarted { execution_id: Uuid },
    StepCompleted { execution_id: Uuid, step_id: String, duration_ms: u64, cached: bool },
    StepFailed { execution_id: Uuid, step_id: String, error: String, retryable: bool },
    ExecutionRetrying { execution_id: Uuid, retry_count: u32 },
    ExecutionCompleted { execution_id: Uuid, duration_ms: u64 },
    ExecutionFailed { execution_id: Uuid, error: String },
    ExecutionCancelled { execution_id: Uuid },
    EngineStarted,
    EngineStopped,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget; nobody listening is fine.
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
