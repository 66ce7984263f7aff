//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models. Domain types live in the `engine` crate,
//! which converts to and from these rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Statuses after which an execution row is frozen.
pub const TERMINAL_STATUSES: [&str; 3] = ["completed", "failed", "cancelled"];

pub fn is_terminal(status: &str) -> bool {
    TERMINAL_STATUSES.contains(&status)
}

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition (latest registered version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    /// Full JSON workflow definition (steps, priority, triggers, ...).
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// A persisted workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub status: String,
    pub priority: String,
    pub input: serde_json::Value,
    pub context: serde_json::Value,
    /// Step executions in the order they started.
    pub steps: serde_json::Value,
    pub metrics: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Query filter for execution listings. Newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self { workflow_id: None, status: None, limit: 50, offset: 0 }
    }
}
