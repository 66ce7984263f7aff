//! Protocol-device agents (read / subscribe / browse).
//!
//! The agents only speak [`DeviceGateway`]; a real deployment plugs in an
//! OPC UA or Modbus client, tests use [`InMemoryDeviceGateway`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{required_str, string_list};
use crate::{Agent, AgentError, AgentRequest};

/// Access to plant devices and their tags.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Current values of `tags` (all tags when empty).
    async fn read(&self, device_id: &str, tags: &[String]) -> Result<Map<String, Value>, AgentError>;

    /// Start a change subscription; returns its id.
    async fn subscribe(&self, device_id: &str, tags: &[String]) -> Result<String, AgentError>;

    /// Tag names exposed by a device.
    async fn browse(&self, device_id: &str) -> Result<Vec<String>, AgentError>;

    /// Known device ids.
    async fn devices(&self) -> Result<Vec<String>, AgentError>;
}

/// Device simulator. Devices marked offline answer like a refused connection.
#[derive(Default)]
pub struct InMemoryDeviceGateway {
    devices: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
    offline: RwLock<HashSet<String>>,
    subscriptions: RwLock<HashMap<String, (String, Vec<String>)>>,
}

impl InMemoryDeviceGateway {
    pub fn set_tag(&self, device_id: &str, tag: &str, value: Value) {
        if let Ok(mut devices) = self.devices.write() {
            devices.entry(device_id.to_owned()).or_default().insert(tag.to_owned(), value);
        }
    }

    pub fn set_online(&self, device_id: &str, online: bool) {
        if let Ok(mut offline) = self.offline.write() {
            if online {
                offline.remove(device_id);
            } else {
                offline.insert(device_id.to_owned());
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Failures are worded like a protocol client's and classified from the text.
    fn device(&self, device_id: &str) -> Result<BTreeMap<String, Value>, AgentError> {
        if self.offline.read().map(|o| o.contains(device_id)).unwrap_or(false) {
            return Err(AgentError::classify(format!("connection refused by device '{device_id}'")));
        }
        self.devices
            .read()
            .ok()
            .and_then(|d| d.get(device_id).cloned())
            .ok_or_else(|| AgentError::classify(format!("unknown device '{device_id}'")))
    }
}

#[async_trait]
impl DeviceGateway for InMemoryDeviceGateway {
    async fn read(&self, device_id: &str, tags: &[String]) -> Result<Map<String, Value>, AgentError> {
        let device = self.device(device_id)?;
        if tags.is_empty() {
            return Ok(device.into_iter().collect());
        }
        tags.iter()
            .map(|t| {
                device
                    .get(t)
                    .map(|v| (t.clone(), v.clone()))
                    .ok_or_else(|| AgentError::Fatal(format!("device '{device_id}' has no tag '{t}'")))
            })
            .collect()
    }

    async fn subscribe(&self, device_id: &str, tags: &[String]) -> Result<String, AgentError> {
        self.device(device_id)?;
        let id = Uuid::new_v4().to_string();
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.insert(id.clone(), (device_id.to_owned(), tags.to_vec()));
        }
        Ok(id)
    }

    async fn browse(&self, device_id: &str) -> Result<Vec<String>, AgentError> {
        Ok(self.device(device_id)?.into_keys().collect())
    }

    async fn devices(&self) -> Result<Vec<String>, AgentError> {
        Ok(self.devices.read().map(|d| d.keys().cloned().collect()).unwrap_or_default())
    }
}

pub struct DeviceReadAgent {
    gateway: Arc<dyn DeviceGateway>,
}

impl DeviceReadAgent {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Agent for DeviceReadAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let device_id = required_str(request.setting("device_id"), "device_id")?;
        let tags = string_list(request.setting("tags"));
        let values = self.gateway.read(device_id, &tags).await?;
        Ok(json!({ "device_id": device_id, "values": values }))
    }
}

pub struct DeviceSubscribeAgent {
    gateway: Arc<dyn DeviceGateway>,
}

impl DeviceSubscribeAgent {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Agent for DeviceSubscribeAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let device_id = required_str(request.setting("device_id"), "device_id")?;
        let tags = string_list(request.setting("tags"));
        let subscription_id = self.gateway.subscribe(device_id, &tags).await?;
        Ok(json!({ "device_id": device_id, "subscription_id": subscription_id, "tags": tags }))
    }
}

pub struct DeviceBrowseAgent {
    gateway: Arc<dyn DeviceGateway>,
}

impl DeviceBrowseAgent {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Agent for DeviceBrowseAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let device_id = required_str(request.setting("device_id"), "device_id")?;
        let tags = self.gateway.browse(device_id).await?;
        Ok(json!({ "device_id": device_id, "tags": tags }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionContext;

    fn gateway() -> Arc<InMemoryDeviceGateway> {
        let gw = Arc::new(InMemoryDeviceGateway::default());
        gw.set_tag("press-1", "temp", json!(71.5));
        gw.set_tag("press-1", "rpm", json!(1200));
        gw
    }

    fn request(config: Value) -> AgentRequest {
        AgentRequest::new("device_read", Value::Null, ExecutionContext::default()).with_config(config)
    }

    #[tokio::test]
    async fn reads_requested_tags() {
        let agent = DeviceReadAgent::new(gateway());
        let out = agent.execute(&request(json!({"device_id": "press-1", "tags": ["temp"]}))).await.unwrap();
        assert_eq!(out["values"], json!({"temp": 71.5}));
    }

    #[tokio::test]
    async fn offline_device_is_retryable() {
        let gw = gateway();
        gw.set_online("press-1", false);
        let err = DeviceReadAgent::new(gw).execute(&request(json!({"device_id": "press-1"}))).await.unwrap_err();
        assert!(matches!(err, AgentError::Retryable(msg) if msg.contains("press-1")));
    }

    #[tokio::test]
    async fn unknown_device_is_fatal() {
        let err = DeviceBrowseAgent::new(gateway()).execute(&request(json!({"device_id": "press-9"}))).await.unwrap_err();
        assert!(matches!(err, AgentError::Fatal(_)));
    }

    #[tokio::test]
    async fn browse_and_subscribe() {
        let gw = gateway();
        let out = DeviceBrowseAgent::new(gw.clone()).execute(&request(json!({"device_id": "press-1"}))).await.unwrap();
        assert_eq!(out["tags"], json!(["rpm", "temp"]));

        DeviceSubscribeAgent::new(gw.clone())
            .execute(&request(json!({"device_id": "press-1", "tags": ["rpm"]})))
            .await
            .unwrap();
        assert_eq!(gw.subscription_count(), 1);
    }

    #[tokio::test]
    async fn unknown_tag_is_fatal() {
        let err = DeviceReadAgent::new(gateway())
            .execute(&request(json!({"device_id": "press-1", "tags": ["pressure"]})))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Fatal(_)));
    }
}
