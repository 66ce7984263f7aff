//! Pub/sub bridge agents (publish / subscribe / read-back).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::required_str;
use crate::{Agent, AgentError, AgentRequest};

/// Topic-based message bus with offset read-back.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish and return the message offset within the topic.
    async fn publish(&self, topic: &str, payload: Value) -> Result<u64, AgentError>;

    async fn subscribe(&self, topic: &str) -> Result<String, AgentError>;

    /// Messages with offset `>= from`, at most `limit`.
    async fn read(&self, topic: &str, from: u64, limit: usize) -> Result<Vec<(u64, Value)>, AgentError>;
}

#[derive(Default)]
pub struct InMemoryMessageBus {
    topics: RwLock<HashMap<String, Vec<Value>>>,
    subscribers: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemoryMessageBus {
    pub fn subscribers(&self, topic: &str) -> usize {
        self.subscribers.read().ok().and_then(|s| s.get(topic).map(Vec::len)).unwrap_or(0)
    }
}

fn poisoned() -> AgentError {
    AgentError::Retryable("message bus unavailable".into())
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<u64, AgentError> {
        let mut topics = self.topics.write().map_err(|_| poisoned())?;
        let log = topics.entry(topic.to_owned()).or_default();
        log.push(payload);
        Ok(log.len() as u64 - 1)
    }

    async fn subscribe(&self, topic: &str) -> Result<String, AgentError> {
        let id = Uuid::new_v4().to_string();
        self.subscribers.write().map_err(|_| poisoned())?.entry(topic.to_owned()).or_default().push(id.clone());
        Ok(id)
    }

    async fn read(&self, topic: &str, from: u64, limit: usize) -> Result<Vec<(u64, Value)>, AgentError> {
        let topics = self.topics.read().map_err(|_| poisoned())?;
        Ok(topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .skip(from as usize)
                    .take(limit)
                    .map(|(i, v)| (i as u64, v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub struct PubSubPublishAgent {
    bus: Arc<dyn MessageBus>,
}

impl PubSubPublishAgent {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Agent for PubSubPublishAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let topic = required_str(request.config.get("topic"), "topic")?;
        // Publish `payload` from the input when present, otherwise the whole input.
        let payload = request.input.get("payload").cloned().unwrap_or_else(|| request.input.clone());
        let offset = self.bus.publish(topic, payload).await?;
        Ok(json!({ "topic": topic, "offset": offset }))
    }
}

pub struct PubSubSubscribeAgent {
    bus: Arc<dyn MessageBus>,
}

impl PubSubSubscribeAgent {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Agent for PubSubSubscribeAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let topic = required_str(request.setting("topic"), "topic")?;
        let subscription_id = self.bus.subscribe(topic).await?;
        Ok(json!({ "topic": topic, "subscription_id": subscription_id }))
    }
}

pub struct PubSubReadAgent {
    bus: Arc<dyn MessageBus>,
}

impl PubSubReadAgent {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Agent for PubSubReadAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let topic = required_str(request.setting("topic"), "topic")?;
        let from = request.setting("from_offset").and_then(Value::as_u64).unwrap_or(0);
        let limit = request.setting("limit").and_then(Value::as_u64).unwrap_or(100) as usize;

        let messages = self.bus.read(topic, from, limit).await?;
        let next_offset = messages.last().map_or(from, |(o, _)| o + 1);
        let messages: Vec<Value> = messages.into_iter().map(|(o, v)| json!({ "offset": o, "payload": v })).collect();
        Ok(json!({ "topic": topic, "messages": messages, "next_offset": next_offset }))
    }
}
