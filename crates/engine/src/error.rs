//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use agents::AgentError;

use crate::models::ExecutionStatus;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors produced by the workflow engine (validation, admission, execution, infrastructure).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more steps share the same id.
    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    /// A `depends_on` entry names a step that does not exist.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("workflow graph contains a cycle: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("workflow has {count} steps, the limit is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("definition limit of {max} reached")]
    DefinitionLimit { max: usize },

    #[error("input is {size} bytes, the limit is {max}")]
    InputTooLarge { size: usize, max: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ------ Admission and lookup errors ------

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} already exists")]
    DuplicateExecution(Uuid),

    #[error("{active} executions active, the limit is {max}")]
    CapacityExceeded { active: usize, max: usize },

    #[error("actor '{actor}' lacks permission '{permission}'")]
    Unauthorized { actor: String, permission: String },

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: ExecutionStatus, to: ExecutionStatus },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),

    // ------ Execution errors ------

    /// A step failed; `source` carries the agent's classification.
    #[error("step '{step_id}' failed: {source}")]
    StepFailed {
        step_id: String,
        #[source]
        source: AgentError,
    },

    // ------ Infrastructure ------

    #[error("lock error: {0}")]
    Lock(#[from] locks::LockError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("coordination store error: {0}")]
    Coord(#[from] coord::CoordError),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Malformed definitions and inputs. Never retried, surfaced to the caller.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStepId(_)
                | Self::UnknownDependency { .. }
                | Self::CycleDetected { .. }
                | Self::InvalidDefinition(_)
                | Self::TooManySteps { .. }
                | Self::DefinitionLimit { .. }
                | Self::InputTooLarge { .. }
                | Self::InvalidInput(_)
        )
    }

    /// Whether the same call may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CapacityExceeded { .. } | Self::Coord(_) | Self::Queue(queue::QueueError::Store(_)) => true,
            Self::StepFailed { source, .. } => source.is_retryable(),
            Self::Lock(e) => e.is_retryable(),
            Self::Pool(e) => e.is_retryable(),
            Self::Database(db::DbError::Sqlx(_)) => true,
            _ => false,
        }
    }
}
