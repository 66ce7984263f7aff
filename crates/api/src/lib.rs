//! `api` crate: HTTP REST surface over [`WorkflowEngine`].
//!
//! Routes:
//!   POST /api/v1/workflows                   register (or re-version) a workflow
//!   GET  /api/v1/workflows                   list workflows
//!   GET  /api/v1/workflows/:id               fetch one workflow
//!   POST /api/v1/workflows/:id/execute       start an execution
//!   POST /api/v1/webhook/*path               start the workflow bound to a webhook
//!   GET  /api/v1/executions                  list executions
//!   GET  /api/v1/executions/:id              fetch one execution
//!   POST /api/v1/executions/:id/cancel       cancel an execution
//!   GET  /api/v1/metrics                     engine metrics snapshot
//!   GET  /health                             liveness

pub mod actor;
pub mod error;
pub mod handlers;

use std::future::Future;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use engine::WorkflowEngine;

pub use error::{ApiError, ApiResult};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
}

pub fn router(engine: WorkflowEngine) -> Router {
    let v1 = Router::new()
        .route("/workflows", post(handlers::workflows::register).get(handlers::workflows::list))
        .route("/workflows/:id", get(handlers::workflows::get))
        .route("/workflows/:id/execute", post(handlers::workflows::execute))
        .route("/webhook/*path", post(handlers::webhooks::trigger))
        .route("/executions", get(handlers::executions::list))
        .route("/executions/:id", get(handlers::executions::get))
        .route("/executions/:id/cancel", post(handlers::executions::cancel))
        .route("/metrics", get(handlers::metrics::snapshot));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .nest("/api/v1", v1)
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(bind: &str, engine: WorkflowEngine, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, router(engine)).with_graceful_shutdown(shutdown).await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use agents::mock::MockAgent;
    use agents::AgentRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use engine::{EngineConfig, RoleAuthorizer, WorkerCounts};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn engine() -> WorkflowEngine {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(MockAgent::returning("echo", json!({"ok": true}))));
        let config = EngineConfig {
            workers: WorkerCounts { critical: 1, high: 1, normal: 1, background: 1 },
            dequeue_wait: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        WorkflowEngine::builder().config(config).agents(registry).build().await.unwrap()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                request = request.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, json)
    }

    fn one_step(name: &str) -> Value {
        json!({ "name": name, "steps": [{ "id": "a", "agent_type": "echo" }] })
    }

    #[tokio::test]
    async fn register_then_get_and_list() {
        let app = router(engine().await);

        let (status, created) = send(&app, "POST", "/api/v1/workflows", Some(one_step("inspect"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["version"], 1);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, fetched) = send(&app, "GET", &format!("/api/v1/workflows/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["name"], "inspect");

        let (status, listed) = send(&app, "GET", "/api/v1/workflows?limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cyclic_definition_is_a_bad_request() {
        let app = router(engine().await);
        let body = json!({
            "name": "loop",
            "steps": [
                { "id": "a", "agent_type": "echo", "depends_on": ["b"] },
                { "id": "b", "agent_type": "echo", "depends_on": ["a"] }
            ]
        });
        let (status, err) = send(&app, "POST", "/api/v1/workflows", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["error"].as_str().unwrap().contains("cycle"));
        assert_eq!(err["retryable"], false);
    }

    #[tokio::test]
    async fn execute_runs_and_execution_is_readable() {
        let engine = engine().await;
        engine.start().unwrap();
        let app = router(engine.clone());

        let (_, created) = send(&app, "POST", "/api/v1/workflows", Some(one_step("run"))).await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, accepted) =
            send(&app, "POST", &format!("/api/v1/workflows/{id}/execute"), Some(json!({"input": {"x": 1}}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let execution_id = accepted["execution_id"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for _ in 0..200 {
            let (_, exec) = send(&app, "GET", &format!("/api/v1/executions/{execution_id}"), None).await;
            last = exec;
            if last["status"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last["status"], "completed");

        let (status, listed) = send(&app, "GET", "/api/v1/executions?status=completed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, cancelled) = send(&app, "POST", &format!("/api/v1/executions/{execution_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["cancelled"], false);
        engine.stop().await;
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let app = router(engine().await);
        let missing = uuid::Uuid::new_v4();

        let (status, _) = send(&app, "GET", &format!("/api/v1/executions/{missing}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", &format!("/api/v1/workflows/{missing}/execute"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", "/api/v1/webhook/nobody/listens", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_starts_the_bound_workflow() {
        let app = router(engine().await);
        let mut body = one_step("hook");
        body["triggers"] = json!([{ "type": "webhook", "path": "line-3/alarm" }]);
        send(&app, "POST", "/api/v1/workflows", Some(body)).await;

        let (status, accepted) = send(&app, "POST", "/api/v1/webhook/line-3/alarm", Some(json!({"level": 2}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted["status"], "queued");
    }

    #[tokio::test]
    async fn bad_status_filter_is_rejected() {
        let app = router(engine().await);
        let (status, _) = send(&app, "GET", "/api/v1/executions?status=exploded", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn roles_come_from_headers() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(MockAgent::returning("echo", json!({}))));
        let engine = WorkflowEngine::builder()
            .agents(registry)
            .authorizer(Arc::new(RoleAuthorizer::with_default_roles()))
            .build()
            .await
            .unwrap();
        let app = router(engine);

        let request = |roles: &str| {
            Request::builder()
                .method("POST")
                .uri("/api/v1/workflows")
                .header("content-type", "application/json")
                .header(actor::ACTOR_HEADER, "dana")
                .header(actor::ROLES_HEADER, roles)
                .body(Body::from(one_step("guarded").to_string()))
                .unwrap()
        };
        let denied = app.clone().oneshot(request("viewer")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let allowed = app.oneshot(request("viewer, admin")).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn anonymous_callers_are_refused_under_roles() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(MockAgent::returning("echo", json!({}))));
        let engine = WorkflowEngine::builder()
            .agents(registry)
            .authorizer(Arc::new(RoleAuthorizer::with_default_roles()))
            .build()
            .await
            .unwrap();
        let app = router(engine);

        let (status, body) = send(&app, "POST", "/api/v1/workflows", Some(one_step("open"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap_or_default().contains("anonymous"), "{body}");
    }

    #[tokio::test]
    async fn metrics_and_health_respond() {
        let app = router(engine().await);
        let (status, metrics) = send(&app, "GET", "/api/v1/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(metrics["submitted"], 0);
        assert_eq!(metrics["queues"].as_array().unwrap().len(), 4);

        let (status, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");
    }
}
