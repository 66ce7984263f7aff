//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow and an execution
//! look like in memory. They convert to and from the `db` row structs; the
//! full definition lives in the JSONB `definition` column of `workflows`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use db::{ExecutionRow, WorkflowRow};
pub use queue::Priority;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a workflow is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Triggered by an incoming HTTP request to `/webhook/{path}`.
    Webhook {
        /// URL path segment that identifies this workflow.
        path: String,
    },
    /// Triggered manually via the REST API.
    Manual,
    /// Triggered on a cron schedule.
    Cron {
        /// Standard cron expression (5 fields).
        expression: String,
    },
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique identifier within this workflow (referenced by `depends_on`).
    pub id: String,
    /// Selects the agent that runs this step.
    pub agent_type: String,
    /// Passed to the agent as `config` at execution time.
    #[serde(default)]
    pub config: Value,
    /// Steps that must complete before this one becomes eligible.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides the engine's step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether outputs may be served from the result cache.
    #[serde(default)]
    pub cacheable: bool,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            config: Value::Null,
            depends_on: Vec::new(),
            timeout_ms: None,
            cacheable: false,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete, versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "first_version")]
    pub version: u32,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn first_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Manual-trigger, normal-priority definition at version 1.
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            steps,
            priority: Priority::Normal,
            triggers: vec![Trigger::Manual],
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn has_webhook(&self, path: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, Trigger::Webhook { path: p } if p == path))
    }

    /// True when both describe the same workflow, ignoring version and timestamps.
    pub fn same_content(&self, other: &WorkflowDefinition) -> bool {
        self.name == other.name
            && self.steps == other.steps
            && self.priority == other.priority
            && self.triggers == other.triggers
    }

    pub fn to_row(&self) -> Result<WorkflowRow, EngineError> {
        Ok(WorkflowRow {
            id: self.id,
            name: self.name.clone(),
            version: self.version as i32,
            definition: serde_json::to_value(self)?,
            created_at: self.created_at,
            updated_at: Utc::now(),
        })
    }

    pub fn from_row(row: &WorkflowRow) -> Result<Self, EngineError> {
        let mut def: WorkflowDefinition = serde_json::from_value(row.definition.clone())?;
        def.id = row.id;
        def.version = row.version.max(0) as u32;
        Ok(def)
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed edges of the execution state machine.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Cancelled) | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EngineError::InvalidInput(format!("unknown execution status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One attempt at one step. A retry appends a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub agent_type: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// 1-based, counted across queue redeliveries.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Served from the result cache without calling the agent.
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl StepExecution {
    pub fn start(step: &WorkflowStep, input: Value, attempt: u32) -> Self {
        Self {
            step_id: step.id.clone(),
            agent_type: step.agent_type.clone(),
            status: StepStatus::Running,
            input,
            output: None,
            error: None,
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            cached: false,
            logs: vec![format!("attempt {attempt} started")],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != StepStatus::Running
    }

    /// No-op once terminal.
    pub fn complete(&mut self, output: Value, duration_ms: u64) {
        if self.is_terminal() {
            return;
        }
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.logs.push(format!("completed in {duration_ms}ms"));
    }

    /// No-op once terminal.
    pub fn fail(&mut self, error: impl Into<String>, duration_ms: u64) {
        if self.is_terminal() {
            return;
        }
        let error = error.into();
        self.status = StepStatus::Failed;
        self.logs.push(format!("failed after {duration_ms}ms: {error}"));
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// Caller-supplied context carried through every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Enqueue to first delivery.
    pub queue_time_ms: Option<u64>,
    /// First delivery to terminal state.
    pub execution_time_ms: Option<u64>,
    /// Queue-level redeliveries.
    pub retry_count: u32,
    pub steps_completed: u32,
}

/// One run of a workflow version against one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub priority: Priority,
    pub input: Value,
    pub context: RequestContext,
    pub steps: Vec<StepExecution>,
    pub error: Option<String>,
    pub metrics: ExecutionMetrics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(id: Uuid, definition: &WorkflowDefinition, input: Value, context: RequestContext) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_id: definition.id,
            workflow_version: definition.version,
            status: ExecutionStatus::Queued,
            priority: definition.priority,
            input,
            context,
            steps: Vec::new(),
            error: None,
            metrics: ExecutionMetrics::default(),
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping timestamps. Rejects any edge outside the state machine.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition { from: self.status, to: next });
        }
        let now = Utc::now();
        match next {
            ExecutionStatus::Running => {
                self.started_at = Some(now);
                self.metrics.queue_time_ms = Some(millis_between(self.created_at, now));
            }
            s if s.is_terminal() => {
                self.finished_at = Some(now);
                if let Some(started) = self.started_at {
                    self.metrics.execution_time_ms = Some(millis_between(started, now));
                }
            }
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Output of the latest completed record per step.
    pub fn completed_outputs(&self) -> HashMap<String, Value> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.output.clone().map(|o| (s.step_id.clone(), o)))
            .collect()
    }

    /// Number of records already written for `step_id`.
    pub fn attempts_for(&self, step_id: &str) -> u32 {
        self.steps.iter().filter(|s| s.step_id == step_id).count() as u32
    }

    pub fn to_row(&self) -> Result<ExecutionRow, EngineError> {
        Ok(ExecutionRow {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version as i32,
            status: self.status.as_str().to_string(),
            priority: self.priority.as_str().to_string(),
            input: self.input.clone(),
            context: serde_json::to_value(&self.context)?,
            steps: serde_json::to_value(&self.steps)?,
            metrics: serde_json::to_value(&self.metrics)?,
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        })
    }

    pub fn from_row(row: &ExecutionRow) -> Result<Self, EngineError> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            workflow_version: row.workflow_version.max(0) as u32,
            status: row.status.parse()?,
            priority: row.priority.parse().map_err(EngineError::InvalidInput)?,
            input: row.input.clone(),
            context: serde_json::from_value(row.context.clone())?,
            steps: serde_json::from_value(row.steps.clone())?,
            metrics: serde_json::from_value(row.metrics.clone())?,
            error: row.error.clone(),
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

// ---------------------------------------------------------------------------
// Queue payload
// ---------------------------------------------------------------------------

/// What a worker needs to pick an execution up. Carried as the queue message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub input: Value,
    pub context: RequestContext,
    pub lock_token: Option<String>,
}
