use axum::extract::State;
use axum::Json;

use engine::MetricsSnapshot;

use crate::error::ApiResult;
use crate::AppState;

pub async fn snapshot(State(state): State<AppState>) -> ApiResult<Json<MetricsSnapshot>> {
    Ok(Json(state.engine.metrics().await?))
}
