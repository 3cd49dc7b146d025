//! HTTP server for the control plane.
//!
//! Provides endpoints for:
//! - Task submission, queries and lifecycle commands (`/v1/tasks`)
//! - The worker protocol: register, heartbeat, report, checkpoint (`/v1/workers`, `/v1/tasks/:id/...`)
//! - Lifecycle events as Server-Sent Events (`/v1/events`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod error;
mod handlers;
pub mod responses;

pub use error::ApiError;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Task routes
        .route("/v1/tasks", get(handlers::list_tasks).post(handlers::create_task))
        .route("/v1/tasks/:id", get(handlers::get_task))
        .route("/v1/tasks/:id/report", post(handlers::report_task))
        .route(
            "/v1/tasks/:id/checkpoints",
            get(handlers::list_checkpoints)
                .post(handlers::create_checkpoint)
                .delete(handlers::delete_all_checkpoints),
        )
        .route("/v1/tasks/:id/checkpoints/latest", get(handlers::latest_checkpoint))
        .route(
            "/v1/tasks/:id/checkpoints/:sequence",
            delete(handlers::delete_checkpoint),
        )
        .route("/v1/tasks/:id/progress", get(handlers::task_progress))
        .route("/v1/tasks/:id/blocking", get(handlers::blocking_dependencies))
        .route("/v1/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/v1/tasks/:id/pause", post(handlers::pause_task))
        .route("/v1/tasks/:id/resume", post(handlers::resume_task))
        .route("/v1/tasks/:id/assign", post(handlers::assign_task))
        // Worker routes
        .route(
            "/v1/workers",
            get(handlers::list_workers).post(handlers::register_worker),
        )
        .route("/v1/workers/stats", get(handlers::worker_stats))
        .route(
            "/v1/workers/:id",
            get(handlers::get_worker).delete(handlers::deregister_worker),
        )
        .route("/v1/workers/:id/heartbeat", post(handlers::heartbeat))
        .route("/v1/workers/:id/drain", post(handlers::drain_worker))
        // Event stream
        .route("/v1/events", get(handlers::stream_events))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_router(AppState::new(Config::default()));
        let (status, body) = call(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_task_lifecycle_over_http() {
        let router = create_router(AppState::new(Config::default()));

        let (status, task) = call(
            &router,
            "POST",
            "/v1/tasks",
            Some(json!({"type": "build", "owner": "alice", "payload": {"repo": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["state"], "pending");
        let task_id = task["id"].as_str().unwrap().to_string();

        let (status, worker) = call(
            &router,
            "POST",
            "/v1/workers",
            Some(json!({"hostname": "h1", "capabilities": ["build"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let worker_id = worker["id"].as_str().unwrap().to_string();

        let (status, assigned) = call(
            &router,
            "POST",
            &format!("/v1/tasks/{task_id}/assign"),
            Some(json!({"worker_id": worker_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(assigned["state"], "assigned");

        let (_, reply) = call(
            &router,
            "POST",
            &format!("/v1/workers/{worker_id}/heartbeat"),
            Some(json!({"status": "online"})),
        )
        .await;
        assert_eq!(reply["directive"], "continue");
        assert_eq!(reply["assignment"]["task"]["id"], task_id.as_str());

        let (status, _) = call(
            &router,
            "POST",
            &format!("/v1/tasks/{task_id}/report"),
            Some(json!({"worker_id": worker_id, "status": "running"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, checkpoint) = call(
            &router,
            "POST",
            &format!("/v1/tasks/{task_id}/checkpoints"),
            Some(json!({"worker_id": worker_id, "name": "compiled", "data": {"step": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(checkpoint["sequence"], 1);

        let (status, latest) = call(
            &router,
            "GET",
            &format!("/v1/tasks/{task_id}/checkpoints/latest"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["name"], "compiled");

        let (_, done) = call(
            &router,
            "POST",
            &format!("/v1/tasks/{task_id}/report"),
            Some(json!({"worker_id": worker_id, "status": "completed", "result": {"ok": true}})),
        )
        .await;
        assert_eq!(done["state"], "completed");
        assert!(done.get("assigned_worker").map_or(true, Value::is_null));

        let (_, page) = call(&router, "GET", "/v1/tasks?state=completed", None).await;
        assert_eq!(page["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let router = create_router(AppState::new(Config::default()));

        let (status, body) = call(&router, "GET", "/v1/tasks/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));

        let (status, _) = call(&router, "POST", "/v1/tasks", Some(json!({"owner": "alice"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, task) = call(
            &router,
            "POST",
            "/v1/tasks",
            Some(json!({"type": "deploy", "owner": "alice"})),
        )
        .await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let (status, _) = call(&router, "POST", &format!("/v1/tasks/{task_id}/pause"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, worker) = call(
            &router,
            "POST",
            "/v1/workers",
            Some(json!({"capabilities": ["build"]})),
        )
        .await;
        let (status, _) = call(
            &router,
            "POST",
            &format!("/v1/tasks/{task_id}/assign"),
            Some(json!({"worker_id": worker["id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(&router, "GET", "/v1/tasks?state=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dependencies_progress_and_checkpoint_deletion() {
        let router = create_router(AppState::new(Config::default()));

        let (_, parent) = call(
            &router,
            "POST",
            "/v1/tasks",
            Some(json!({"type": "Build", "owner": "alice"})),
        )
        .await;
        assert_eq!(parent["task_type"], "build");
        let parent_id = parent["id"].as_str().unwrap().to_string();

        let (status, child) = call(
            &router,
            "POST",
            "/v1/tasks",
            Some(json!({"type": "build", "owner": "alice", "dependencies": [parent_id]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let child_id = child["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &router,
            "POST",
            "/v1/tasks",
            Some(json!({"type": "build", "owner": "alice", "dependencies": ["ghost"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, blocking) = call(&router, "GET", &format!("/v1/tasks/{child_id}/blocking"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(blocking[0]["id"], parent_id.as_str());

        let (_, progress) = call(&router, "GET", &format!("/v1/tasks/{child_id}/progress"), None).await;
        assert_eq!(progress["percent"], 0);
        assert_eq!(progress["blocked_by"][0], parent_id.as_str());

        for step in 1..=2 {
            call(
                &router,
                "POST",
                &format!("/v1/tasks/{parent_id}/checkpoints"),
                Some(json!({"data": {"step": step}})),
            )
            .await;
        }

        let uri = format!("/v1/tasks/{parent_id}/checkpoints/2");
        let (status, _) = call(&router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, latest) = call(&router, "GET", &format!("/v1/tasks/{parent_id}/checkpoints/latest"), None).await;
        assert_eq!(latest["sequence"], 1);

        let (status, deleted) = call(&router, "DELETE", &format!("/v1/tasks/{parent_id}/checkpoints"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["deleted"], 1);
    }

    #[tokio::test]
    async fn test_worker_routes() {
        let router = create_router(AppState::new(Config::default()));

        let (_, worker) = call(
            &router,
            "POST",
            "/v1/workers",
            Some(json!({"hostname": "h1", "capabilities": ["test"]})),
        )
        .await;
        let worker_id = worker["id"].as_str().unwrap().to_string();

        let (status, drained) = call(&router, "POST", &format!("/v1/workers/{worker_id}/drain"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(drained["status"], "draining");

        let (_, stats) = call(&router, "GET", "/v1/workers/stats", None).await;
        assert_eq!(stats["draining"], 1);

        let (status, _) = call(&router, "DELETE", &format!("/v1/workers/{worker_id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&router, "GET", &format!("/v1/workers/{worker_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let router = create_router(AppState::new(Config::default()));
        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("waypoint_tasks{state=\"pending\"} 0"));
    }
}
