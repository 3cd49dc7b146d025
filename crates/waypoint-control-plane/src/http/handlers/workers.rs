//! Worker protocol and worker query handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};

use waypoint_core::{Worker, WorkerId, WorkerRegistration};

use crate::http::error::ApiError;
use crate::http::responses::HeartbeatRequest;
use crate::manager::HeartbeatReply;
use crate::registry::WorkerStats;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// GET /v1/workers - all workers ordered by id.
pub async fn list_workers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Worker>>> {
    Ok(Json(state.manager.list_workers().await?))
}

/// GET /v1/workers/stats
pub async fn worker_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<WorkerStats>> {
    Ok(Json(state.manager.worker_stats().await?))
}

/// POST /v1/workers - register a worker.
pub async fn register_worker(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<WorkerRegistration>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Worker>)> {
    let Json(registration) = payload?;
    let worker = state.manager.register_worker(registration).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

pub async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WorkerId>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.manager.get_worker(&id).await?))
}

/// POST /v1/workers/:id/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WorkerId>,
    payload: Option<Json<HeartbeatRequest>>,
) -> ApiResult<Json<HeartbeatReply>> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.manager.heartbeat(&id, request.status).await?))
}

/// POST /v1/workers/:id/drain
pub async fn drain_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WorkerId>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.manager.drain_worker(&id).await?))
}

/// DELETE /v1/workers/:id
pub async fn deregister_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WorkerId>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.manager.deregister_worker(&id).await?))
}
