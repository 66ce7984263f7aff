//! `agents` crate: the [`Agent`] trait, built-in agents and the executor
//! that dispatches a single workflow step.
//!
//! The engine never calls an agent directly: every dispatch goes through
//! [`AgentExecutor`], which resolves the agent by type, wraps the call in the
//! shared circuit breaker and enforces a timeout.

pub mod builtin;
pub mod error;
pub mod executor;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::AgentError;
pub use executor::{AgentExecutor, AgentOutput, ExecutorConfig};
pub use registry::AgentRegistry;
pub use traits::{Agent, AgentRequest, ExecutionContext};
