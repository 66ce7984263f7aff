//! Alert emission.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::required_str;
use crate::{Agent, AgentError, AgentRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: Severity,
    pub message: String,
    pub source: String,
    pub raised_at: DateTime<Utc>,
    pub details: Value,
}

/// Where alerts go (pager, e-mail, chat). The default just logs.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &Alert) -> Result<(), AgentError>;
}

pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AgentError> {
        match alert.severity {
            Severity::Info => info!(alert_id = %alert.id, source = %alert.source, "{}", alert.message),
            Severity::Warning => warn!(alert_id = %alert.id, source = %alert.source, "{}", alert.message),
            Severity::Critical => error!(alert_id = %alert.id, source = %alert.source, "{}", alert.message),
        }
        Ok(())
    }
}

pub struct AlertAgent {
    sink: Arc<dyn AlertSink>,
}

impl AlertAgent {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Agent for AlertAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let message = required_str(request.setting("message"), "message")?;
        let severity = match request.setting("severity") {
            None => Severity::Warning,
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|_| AgentError::Fatal(format!("invalid severity {raw}")))?,
        };
        // Skip when the upstream step reported a healthy result.
        if request.config.get("only_if_unhealthy").and_then(Value::as_bool).unwrap_or(false)
            && request.input.get("healthy").and_then(Value::as_bool) == Some(true)
        {
            return Ok(json!({ "emitted": false }));
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            severity,
            message: message.to_owned(),
            source: format!("{}/{}", request.context.workflow_id, request.context.step_id),
            raised_at: Utc::now(),
            details: request.input.clone(),
        };
        self.sink.emit(&alert).await?;
        Ok(json!({ "emitted": true, "alert_id": alert.id, "severity": alert.severity }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionContext;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Alert>>);

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn emit(&self, alert: &Alert) -> Result<(), AgentError> {
            self.0.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn emits_alert_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let req = AgentRequest::new("alert", json!({"healthy": false}), ExecutionContext::default())
            .with_config(json!({ "message": "press-1 overheating", "severity": "critical" }));

        let out = AlertAgent::new(sink.clone()).execute(&req).await.unwrap();
        assert_eq!(out["emitted"], true);
        let alerts = sink.0.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn skips_healthy_input_when_asked() {
        let sink = Arc::new(RecordingSink::default());
        let req = AgentRequest::new("alert", json!({"healthy": true}), ExecutionContext::default())
            .with_config(json!({ "message": "x", "only_if_unhealthy": true }));

        let out = AlertAgent::new(sink.clone()).execute(&req).await.unwrap();
        assert_eq!(out["emitted"], false);
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
