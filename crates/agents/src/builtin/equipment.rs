//! Equipment telemetry snapshot with threshold evaluation.
//!
//! Config: `{"devices": ["press-1"], "thresholds": {"temp": {"max": 80}}}`.
//! With no `devices` every device known to the gateway is read.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{string_list, DeviceGateway};
use crate::{Agent, AgentError, AgentRequest};

pub struct EquipmentSnapshotAgent {
    gateway: Arc<dyn DeviceGateway>,
}

impl EquipmentSnapshotAgent {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self { gateway }
    }
}

fn breaches(device: &str, values: &Map<String, Value>, thresholds: Option<&Map<String, Value>>) -> Vec<Value> {
    let Some(thresholds) = thresholds else { return Vec::new() };
    let mut out = Vec::new();
    for (tag, limits) in thresholds {
        let Some(v) = values.get(tag).and_then(Value::as_f64) else { continue };
        if let Some(max) = limits.get("max").and_then(Value::as_f64).filter(|m| v > *m) {
            out.push(json!({ "device_id": device, "tag": tag, "value": v, "limit": max, "kind": "max" }));
        }
        if let Some(min) = limits.get("min").and_then(Value::as_f64).filter(|m| v < *m) {
            out.push(json!({ "device_id": device, "tag": tag, "value": v, "limit": min, "kind": "min" }));
        }
    }
    out
}

#[async_trait]
impl Agent for EquipmentSnapshotAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let mut devices = string_list(request.setting("devices"));
        if devices.is_empty() {
            devices = self.gateway.devices().await?;
        }
        let thresholds = request.setting("thresholds").and_then(Value::as_object);

        let mut snapshot = Map::new();
        let mut all_breaches = Vec::new();
        for device in &devices {
            let values = self.gateway.read(device, &[]).await?;
            all_breaches.extend(breaches(device, &values, thresholds));
            snapshot.insert(device.clone(), Value::Object(values));
        }

        Ok(json!({
            "captured_at": Utc::now().to_rfc3339(),
            "devices": snapshot,
            "breaches": all_breaches,
            "healthy": all_breaches.is_empty(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::InMemoryDeviceGateway;
    use crate::ExecutionContext;

    #[tokio::test]
    async fn flags_threshold_breaches() {
        let gw = Arc::new(InMemoryDeviceGateway::default());
        gw.set_tag("press-1", "temp", json!(91.0));
        gw.set_tag("press-2", "temp", json!(60.0));

        let req = AgentRequest::new("equipment_snapshot", Value::Null, ExecutionContext::default())
            .with_config(json!({ "thresholds": { "temp": { "max": 80 } } }));
        let out = EquipmentSnapshotAgent::new(gw).execute(&req).await.unwrap();

        assert_eq!(out["healthy"], false);
        assert_eq!(out["breaches"].as_array().unwrap().len(), 1);
        assert_eq!(out["breaches"][0]["device_id"], "press-1");
        assert_eq!(out["devices"]["press-2"]["temp"], 60.0);
    }
}
