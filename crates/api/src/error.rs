//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(e) if e.is_validation() => StatusCode::BAD_REQUEST,
            Self::Engine(e) => match e {
                EngineError::WorkflowNotFound(_) | EngineError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::DuplicateExecution(_) | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
                EngineError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                EngineError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let retryable = matches!(&self, Self::Engine(e) if e.is_retryable());
        let body = json!({ "error": self.to_string(), "retryable": retryable });
        (status, Json(body)).into_response()
    }
}
