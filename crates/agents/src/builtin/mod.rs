//! Built-in agents.
//!
//! Business logic is kept deliberately small. Agents that talk to plant
//! equipment or a message bus do so through the [`DeviceGateway`] and
//! [`MessageBus`] traits so real protocol clients can be plugged in.

pub mod alert;
pub mod classification;
pub mod compliance;
pub mod device;
pub mod equipment;
pub mod memory;
pub mod pubsub;
pub mod quality;

use std::sync::Arc;

use serde_json::Value;

pub use alert::{Alert, AlertAgent, AlertSink, Severity, TracingAlertSink};
pub use classification::ClassificationAgent;
pub use compliance::ComplianceCheckAgent;
pub use device::{DeviceBrowseAgent, DeviceGateway, DeviceReadAgent, DeviceSubscribeAgent, InMemoryDeviceGateway};
pub use equipment::EquipmentSnapshotAgent;
pub use memory::MemoryPruningAgent;
pub use pubsub::{InMemoryMessageBus, MessageBus, PubSubPublishAgent, PubSubReadAgent, PubSubSubscribeAgent};
pub use quality::QualityAnalysisAgent;

use crate::{AgentError, AgentRegistry};

/// Collaborators the built-in agents need.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn DeviceGateway>,
    pub bus: Arc<dyn MessageBus>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            gateway: Arc::new(InMemoryDeviceGateway::default()),
            bus: Arc::new(InMemoryMessageBus::default()),
            alerts: Arc::new(TracingAlertSink),
        }
    }
}

/// Registry holding every built-in agent under its canonical type name.
pub fn default_registry(collab: &Collaborators) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry
        .register("classification", Arc::new(ClassificationAgent))
        .register("compliance_check", Arc::new(ComplianceCheckAgent))
        .register("memory_pruning", Arc::new(MemoryPruningAgent))
        .register("device_read", Arc::new(DeviceReadAgent::new(collab.gateway.clone())))
        .register("device_subscribe", Arc::new(DeviceSubscribeAgent::new(collab.gateway.clone())))
        .register("device_browse", Arc::new(DeviceBrowseAgent::new(collab.gateway.clone())))
        .register("pubsub_publish", Arc::new(PubSubPublishAgent::new(collab.bus.clone())))
        .register("pubsub_subscribe", Arc::new(PubSubSubscribeAgent::new(collab.bus.clone())))
        .register("pubsub_read", Arc::new(PubSubReadAgent::new(collab.bus.clone())))
        .register("quality_analysis", Arc::new(QualityAnalysisAgent))
        .register("equipment_snapshot", Arc::new(EquipmentSnapshotAgent::new(collab.gateway.clone())))
        .register("alert", Arc::new(AlertAgent::new(collab.alerts.clone())));
    registry
}

// ---------------------------------------------------------------------------
// Small helpers shared by the agents
// ---------------------------------------------------------------------------

pub(crate) fn required_str<'a>(value: Option<&'a Value>, name: &str) -> Result<&'a str, AgentError> {
    value
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Fatal(format!("'{name}' must be a string")))
}

pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_every_builtin() {
        let registry = default_registry(&Collaborators::default());
        assert_eq!(registry.agent_types().len(), 12);
        for t in ["classification", "device_read", "pubsub_read", "quality_analysis", "alert"] {
            assert!(registry.contains(t), "missing {t}");
        }
    }
}
