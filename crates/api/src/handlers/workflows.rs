use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use engine::{ExecuteOptions, Priority, RequestContext, Trigger, WorkflowDefinition, WorkflowStep};

use super::Page;
use crate::actor::RequestActor;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterWorkflowDto {
    /// Omit to create a new workflow; repeat to publish a new version.
    pub id: Option<Uuid>,
    pub name: String,
    pub version: Option<u32>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub priority: Priority,
    pub triggers: Option<Vec<Trigger>>,
}

impl RegisterWorkflowDto {
    fn into_definition(self) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new(self.name, self.steps);
        if let Some(id) = self.id {
            def.id = id;
        }
        if let Some(version) = self.version {
            def.version = version;
        }
        if let Some(triggers) = self.triggers {
            def.triggers = triggers;
        }
        def.priority = self.priority;
        def
    }
}

pub async fn register(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Json(dto): Json<RegisterWorkflowDto>,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    let stored = state.engine.register_workflow(dto.into_definition(), &actor).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn list(State(state): State<AppState>, Query(page): Query<Page>) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    let (limit, offset) = page.clamped();
    Ok(Json(state.engine.list_workflows(limit, offset).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<WorkflowDefinition>> {
    state
        .engine
        .get_workflow(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("workflow {id} not found")))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteDto {
    #[serde(default)]
    pub input: Value,
    pub execution_id: Option<Uuid>,
    pub priority: Option<Priority>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub trace_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl ExecuteDto {
    pub(crate) fn split(self) -> (Value, ExecuteOptions) {
        let context = RequestContext {
            session_id: self.session_id,
            user_id: self.user_id,
            trace_id: self.trace_id.unwrap_or_default(),
            variables: self.variables,
        };
        let options = ExecuteOptions { execution_id: self.execution_id, context, priority: self.priority };
        (self.input, options)
    }
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: &'static str,
}

pub async fn execute(
    State(state): State<AppState>,
    RequestActor(actor): RequestActor,
    Path(id): Path<Uuid>,
    body: Option<Json<ExecuteDto>>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let (input, options) = body.map(|Json(dto)| dto).unwrap_or_default().split();
    let execution_id = state.engine.execute_workflow(id, input, options, &actor).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { execution_id, workflow_id: id, status: "queued" })))
}
