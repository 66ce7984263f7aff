//! The `Agent` trait and the request every agent receives.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::AgentError;

/// Who is running what, passed to every agent call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub trace_id: String,
    /// Free-form variables supplied with the execution.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

/// One step dispatch: `{agent_type, input, config, context}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_type: String,
    pub input: Value,
    #[serde(default)]
    pub config: Value,
    pub context: ExecutionContext,
}

impl AgentRequest {
    pub fn new(agent_type: impl Into<String>, input: Value, context: ExecutionContext) -> Self {
        Self { agent_type: agent_type.into(), input, config: Value::Null, context }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Look a setting up in `config` first, then in `input`.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.config.get(key).or_else(|| self.input.get(key))
    }
}

/// The core agent trait. Every built-in agent and test double implements it.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the agent and return its JSON output.
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError>;
}
