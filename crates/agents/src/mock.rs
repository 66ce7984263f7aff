//! `MockAgent`, a test double for [`Agent`].
//!
//! Useful in unit and integration tests where a real agent implementation is
//! either unavailable or irrelevant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Agent, AgentError, AgentRequest};

/// Behaviour injected into `MockAgent` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value merged with `{"agent": name}`.
    ReturnValue(Value),
    FailRetryable(String),
    FailFatal(String),
    /// Fail retryably `failures` times, then return the value.
    SucceedAfter { failures: u32, value: Value },
    /// Sleep before returning the value.
    Delay { delay: Duration, value: Value },
}

/// A mock agent that records every request it receives.
pub struct MockAgent {
    pub name: String,
    pub behaviour: MockBehaviour,
    /// All requests seen by this agent, in call order.
    pub calls: Arc<Mutex<Vec<AgentRequest>>>,
    attempts: AtomicU32,
}

impl MockAgent {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self { name: name.into(), behaviour, calls: Arc::new(Mutex::new(Vec::new())), attempts: AtomicU32::new(0) }
    }

    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn succeeding_after(name: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with(name, MockBehaviour::SucceedAfter { failures, value })
    }

    pub fn delayed(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with(name, MockBehaviour::Delay { delay, value })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Inputs seen so far, in call order.
    pub fn inputs(&self) -> Vec<Value> {
        self.calls.lock().map(|c| c.iter().map(|r| r.input.clone()).collect()).unwrap_or_default()
    }

    fn output(&self, value: &Value) -> Value {
        let mut out = json!({ "agent": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, v) in v_obj {
                out_obj.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::FailRetryable(msg) => Err(AgentError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(AgentError::Fatal(msg.clone())),
            MockBehaviour::SucceedAfter { failures, value } => {
                if attempt < *failures {
                    Err(AgentError::Retryable(format!("{} not ready (attempt {})", self.name, attempt + 1)))
                } else {
                    Ok(self.output(value))
                }
            }
            MockBehaviour::Delay { delay, value } => {
                tokio::time::sleep(*delay).await;
                Ok(self.output(value))
            }
        }
    }
}
