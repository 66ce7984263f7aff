//! Agent executor.
//!
//! `AgentExecutor` is the single entry point for running one workflow step:
//! 1. Resolves the agent for `agent_type` in the [`AgentRegistry`].
//! 2. Runs it under the shared `agent-executor` circuit breaker.
//! 3. Bounds the call with a timeout.
//!
//! Only retryable failures count against the breaker. A fatal error means the
//! downstream answered and rejected the request, which says nothing about its
//! health.

use std::sync::Arc;
use std::time::{Duration, Instant};

use breaker::{BreakerError, BreakerRegistry, DistributedCircuitBreaker};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{AgentError, AgentRegistry, AgentRequest};

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout applied when the caller does not pass one.
    pub default_timeout: Duration,
    /// Name of the shared breaker wrapping every dispatch.
    pub breaker_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { default_timeout: Duration::from_secs(60), breaker_name: "agent-executor".into() }
    }
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentOutput {
    pub agent_type: String,
    pub output: Value,
    pub duration_ms: u64,
}

pub struct AgentExecutor {
    registry: AgentRegistry,
    breaker: Arc<DistributedCircuitBreaker>,
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(registry: AgentRegistry, breakers: &BreakerRegistry, config: ExecutorConfig) -> Self {
        let breaker = breakers.get(&config.breaker_name);
        Self { registry, breaker, config }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<DistributedCircuitBreaker> {
        &self.breaker
    }

    /// Dispatch with the default timeout.
    pub async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError> {
        self.execute_with_timeout(request, self.config.default_timeout).await
    }

    #[instrument(
        skip(self, request),
        fields(agent_type = %request.agent_type, step_id = %request.context.step_id, execution_id = %request.context.execution_id)
    )]
    pub async fn execute_with_timeout(
        &self,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<AgentOutput, AgentError> {
        let agent = self
            .registry
            .get(&request.agent_type)
            .ok_or_else(|| AgentError::UnknownAgent(request.agent_type.clone()))?;

        let started = Instant::now();
        // Inner `Err` trips the breaker; `Ok(Err(_))` carries a fatal error through untouched.
        let outcome = self
            .breaker
            .execute(|| async {
                match tokio::time::timeout(timeout, agent.execute(request)).await {
                    Err(_) => Err(AgentError::Timeout(timeout)),
                    Ok(Ok(output)) => Ok(Ok(output)),
                    Ok(Err(e)) if e.is_retryable() => Err(e),
                    Ok(Err(e)) => Ok(Err(e)),
                }
            })
            .await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(BreakerError::Inner(e)) => Err(e),
            Err(BreakerError::Open { name, retry_after }) => Err(AgentError::CircuitOpen { breaker: name, retry_after }),
            Err(BreakerError::HalfOpenFull { name }) => {
                Err(AgentError::CircuitOpen { breaker: name, retry_after: Duration::ZERO })
            }
            Err(BreakerError::Store(e)) => Err(AgentError::Retryable(format!("breaker store unavailable: {e}"))),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                debug!(duration_ms, "agent succeeded");
                Ok(AgentOutput { agent_type: request.agent_type.clone(), output, duration_ms })
            }
            Err(e) => {
                warn!(duration_ms, error = %e, retryable = e.is_retryable(), "agent failed");
                Err(e)
            }
        }
    }
}
