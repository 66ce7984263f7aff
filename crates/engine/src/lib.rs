//! `engine` crate: workflow models, DAG validation, step execution and the
//! queue-driven `WorkflowEngine` that ties locks, breakers, pooling and
//! persistence together.

pub mod auth;
pub mod cache;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod input;
pub mod metrics;
pub mod models;
pub mod resources;
pub mod storage;

pub use auth::{Actor, AllowAll, Authorizer, Permission, RoleAuthorizer};
pub use cache::{CacheStats, WorkflowCache};
pub use config::{EngineConfig, WorkerCounts};
pub use dag::validate_dag;
pub use engine::{ExecuteOptions, ExecutionQuery, ShutdownReport, WorkflowEngine, WorkflowEngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus};
pub use executor::{ExecutionObserver, NoopObserver, RunOutcome, WorkflowExecutor};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use models::{
    ExecutionStatus, Priority, RequestContext, StepExecution, StepStatus, Trigger, WorkflowDefinition, WorkflowExecution,
    WorkflowStep,
};
pub use resources::{IdleResource, ResourceGuard, ResourceKind, ResourceManager};

#[cfg(test)]
mod engine_tests;
