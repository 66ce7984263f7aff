//! The storage contract the engine is written against.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{DbError, ExecutionFilter, ExecutionRow, WorkflowRow};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace the definition keyed by `row.id`, and record the
    /// version in the definition history. Both writes commit together.
    async fn upsert_definition(&self, row: &WorkflowRow) -> Result<WorkflowRow, DbError>;

    /// Latest version of a definition.
    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError>;

    /// A specific registered version of a definition.
    async fn get_definition_version(&self, id: Uuid, version: i32) -> Result<Option<WorkflowRow>, DbError>;

    async fn list_definitions(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowRow>, DbError>;

    async fn count_definitions(&self) -> Result<i64, DbError>;

    /// Create an execution row. Fails with [`DbError::Conflict`] if the id exists.
    async fn insert_execution(&self, row: &ExecutionRow) -> Result<(), DbError>;

    /// Overwrite an execution row. Fails with [`DbError::Conflict`] if the
    /// stored row is terminal and `row.status` differs from it.
    async fn update_execution(&self, row: &ExecutionRow) -> Result<(), DbError>;

    /// Remove an execution row; used to undo an insert whose enqueue failed.
    async fn delete_execution(&self, id: Uuid) -> Result<bool, DbError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DbError>;

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRow>, DbError>;

    /// Number of executions per status.
    async fn count_executions_by_status(&self) -> Result<HashMap<String, i64>, DbError>;

    async fn health_check(&self) -> Result<(), DbError>;
}
