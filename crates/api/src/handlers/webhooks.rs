use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use tracing::info;

use engine::ExecuteOptions;

use super::workflows::Accepted;
use crate::actor::RequestActor;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Start the workflow whose webhook trigger matches `path`; the body becomes its input.
pub async fn trigger(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(path): Path<String>,
    body: Option<Json<Value>>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let path = path.trim_matches('/').to_string();
    let workflow = state
        .engine
        .workflow_for_webhook(&path)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no workflow is bound to webhook '{path}'")))?;

    let input = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let execution_id = state.engine.execute_workflow(workflow.id, input, ExecuteOptions::default(), &actor).await?;
    info!(webhook = %path, workflow_id = %workflow.id, execution_id = %execution_id, "webhook accepted");
    Ok((StatusCode::ACCEPTED, Json(Accepted { execution_id, workflow_id: workflow.id, status: "queued" })))
}
