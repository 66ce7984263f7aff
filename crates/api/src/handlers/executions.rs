use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use engine::{ExecutionQuery, ExecutionStatus, WorkflowExecution};

use super::default_limit;
use crate::actor::RequestActor;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListExecutions {
    pub workflow_id: Option<Uuid>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListExecutions>,
) -> ApiResult<Json<Vec<WorkflowExecution>>> {
    let status = params.status.as_deref().map(str::parse::<ExecutionStatus>).transpose()?;
    let query = ExecutionQuery { workflow_id: params.workflow_id, status, limit: params.limit, offset: params.offset };
    Ok(Json(state.engine.list_executions(query).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<WorkflowExecution>> {
    state
        .engine
        .get_execution(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("execution {id} not found")))
}

pub async fn cancel(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let cancelled = state.engine.cancel_execution(id, &actor).await?;
    Ok(Json(json!({ "execution_id": id, "cancelled": cancelled })))
}
