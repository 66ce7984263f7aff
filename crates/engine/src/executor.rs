//! Step runner.
//!
//! `WorkflowExecutor` drives one execution through its steps:
//! 1. Validates the DAG and produces the execution order.
//! 2. Skips steps that already completed on an earlier delivery.
//! 3. Builds each step's input from its dependencies' outputs.
//! 4. Dispatches through the [`AgentExecutor`] with the step's timeout, serving
//!    `cacheable` steps from the result cache when possible.
//! 5. Appends one `StepExecution` per attempt and reports it to the observer,
//!    which persists it.
//! 6. Retries retryable failures in-process with exponential back-off before
//!    handing the failure back for queue-level retry.
//!
//! Cancellation is cooperative: the token is checked between steps and during
//! back-off, never in the middle of an agent call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use agents::{AgentError, AgentExecutor, AgentRequest, ExecutionContext};

use crate::cache::WorkflowCache;
use crate::dag::validate_dag;
use crate::models::{StepExecution, WorkflowDefinition, WorkflowExecution, WorkflowStep};
use crate::EngineResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the step runner.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Used when a step does not set `timeout_ms`.
    pub step_timeout: Duration,
    /// In-process retries of a retryable step failure.
    pub step_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { step_timeout: Duration::from_secs(60), step_retries: 1, retry_base_delay: Duration::from_millis(100) }
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receives the execution after every step record change.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// A new record was appended in `Running` state.
    async fn step_started(&self, execution: &WorkflowExecution) -> EngineResult<()>;
    /// The last record reached a terminal state.
    async fn step_finished(&self, execution: &WorkflowExecution, record: &StepExecution) -> EngineResult<()>;
}

/// Observer that does nothing.
pub struct NoopObserver;

#[async_trait]
impl ExecutionObserver for NoopObserver {
    async fn step_started(&self, _execution: &WorkflowExecution) -> EngineResult<()> {
        Ok(())
    }

    async fn step_finished(&self, _execution: &WorkflowExecution, _record: &StepExecution) -> EngineResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every step completed. Carries the output of the last step in order.
    Completed { output: Value },
    /// A step failed after its in-process retries.
    Failed { step_id: String, error: AgentError },
    /// The token fired before the next step could start.
    Cancelled,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    agents: Arc<AgentExecutor>,
    cache: Arc<WorkflowCache>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(agents: Arc<AgentExecutor>, cache: Arc<WorkflowCache>, config: ExecutorConfig) -> Self {
        Self { agents, cache, config }
    }

    pub fn agents(&self) -> &Arc<AgentExecutor> {
        &self.agents
    }

    /// Run every step of `execution` that has not completed yet.
    ///
    /// # Errors
    /// Validation failures and observer (persistence) errors. Agent failures are
    /// reported as [`RunOutcome::Failed`].
    #[instrument(skip_all, fields(execution_id = %execution.id, workflow_id = %definition.id))]
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        cancel: &CancellationToken,
        observer: &dyn ExecutionObserver,
    ) -> EngineResult<RunOutcome> {
        let order = validate_dag(definition)?;
        let mut outputs = execution.completed_outputs();
        if !outputs.is_empty() {
            info!(resumed = outputs.len(), "resuming execution with completed steps");
        }

        let mut last = Value::Null;
        for step_id in &order {
            if let Some(done) = outputs.get(step_id) {
                last = done.clone();
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            let Some(step) = definition.step(step_id) else { continue };
            let input = step_input(step, &execution.input, &outputs);

            match self.run_step(step, input, execution, cancel, observer).await? {
                Ok(output) => {
                    last = output.clone();
                    outputs.insert(step.id.clone(), output);
                }
                Err(error) => return Ok(RunOutcome::Failed { step_id: step.id.clone(), error }),
            }
        }
        Ok(RunOutcome::Completed { output: last })
    }

    // -----------------------------------------------------------------------
    // Internal: one step, with cache lookup and in-process retry.
    // -----------------------------------------------------------------------

    async fn run_step(
        &self,
        step: &WorkflowStep,
        input: Value,
        execution: &mut WorkflowExecution,
        cancel: &CancellationToken,
        observer: &dyn ExecutionObserver,
    ) -> EngineResult<Result<Value, AgentError>> {
        let cache_key = step.cacheable.then(|| WorkflowCache::result_key(step, &input));
        if let Some(key) = &cache_key {
            if let Some(output) = self.cache.result(key).await {
                let mut record = StepExecution::start(step, input, execution.attempts_for(&step.id) + 1);
                record.cached = true;
                record.complete(output.clone(), 0);
                execution.steps.push(record);
                execution.metrics.steps_completed += 1;
                if let Some(record) = execution.steps.last() {
                    observer.step_finished(execution, record).await?;
                }
                debug!(step_id = %step.id, "step served from result cache");
                return Ok(Ok(output));
            }
        }

        let timeout = step.timeout_ms.map(Duration::from_millis).unwrap_or(self.config.step_timeout);
        let mut retries = 0u32;
        loop {
            let attempt = execution.attempts_for(&step.id) + 1;
            execution.steps.push(StepExecution::start(step, input.clone(), attempt));
            observer.step_started(execution).await?;

            let request = AgentRequest::new(step.agent_type.clone(), input.clone(), agent_context(execution, step))
                .with_config(step.config.clone());
            let started = Instant::now();
            let result = self.agents.execute_with_timeout(&request, timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let idx = execution.steps.len() - 1;
            match &result {
                Ok(out) => {
                    execution.steps[idx].complete(out.output.clone(), duration_ms);
                    execution.metrics.steps_completed += 1;
                }
                Err(e) => execution.steps[idx].fail(e.to_string(), duration_ms),
            }
            observer.step_finished(execution, &execution.steps[idx]).await?;

            match result {
                Ok(out) => {
                    if let Some(key) = cache_key {
                        self.cache.put_result(key, out.output.clone()).await;
                    }
                    return Ok(Ok(out.output));
                }
                // An open breaker will not close within our back-off; leave it to the queue.
                Err(e) if e.is_retryable() && !matches!(e, AgentError::CircuitOpen { .. }) && retries < self.config.step_retries => {
                    retries += 1;
                    let delay = self.backoff(retries);
                    warn!(step_id = %step.id, attempt, error = %e, ?delay, "retryable step failure, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(Err(e)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Ok(Err(e)),
            }
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.retry_base_delay * 2u32.saturating_pow(retry.saturating_sub(1));
        let jitter_cap = (self.config.retry_base_delay.as_millis() / 2) as u64;
        let jitter = if jitter_cap == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_cap) };
        base + Duration::from_millis(jitter)
    }
}

/// No dependencies: the execution input. One: that step's output. Several: an
/// object keyed by dependency id.
pub fn step_input(step: &WorkflowStep, execution_input: &Value, outputs: &HashMap<String, Value>) -> Value {
    match step.depends_on.as_slice() {
        [] => execution_input.clone(),
        [only] => outputs.get(only).cloned().unwrap_or(Value::Null),
        deps => {
            let mut merged = Map::new();
            for dep in deps {
                merged.insert(dep.clone(), outputs.get(dep).cloned().unwrap_or(Value::Null));
            }
            Value::Object(merged)
        }
    }
}

fn agent_context(execution: &WorkflowExecution, step: &WorkflowStep) -> ExecutionContext {
    ExecutionContext {
        workflow_id: execution.workflow_id,
        execution_id: execution.id,
        step_id: step.id.clone(),
        session_id: execution.context.session_id.clone(),
        user_id: execution.context.user_id.clone(),
        trace_id: execution.context.trace_id.clone(),
        variables: execution.context.variables.clone(),
    }
}
