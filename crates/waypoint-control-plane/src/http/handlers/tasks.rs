//! Task, checkpoint and worker-report handlers.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};

use waypoint_core::{Checkpoint, Task, TaskFilters, TaskId};

use crate::http::error::ApiError;
use crate::http::responses::{AssignRequest, CheckpointRequest, DeletedCheckpoints, ReportRequest};
use crate::manager::{NewTask, TaskPage, TaskProgress};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// GET /v1/tasks - one page of tasks matching the query filters.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TaskFilters>, QueryRejection>,
) -> ApiResult<Json<TaskPage>> {
    let Query(filters) = query?;
    Ok(Json(state.manager.list_tasks(&filters).await?))
}

/// POST /v1/tasks - submit a task.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let Json(request) = payload?;
    let task = state.manager.create_task(request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /v1/tasks/:id
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.manager.get_task(&id).await?))
}

/// POST /v1/tasks/:id/report - worker acknowledgment or terminal result.
pub async fn report_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> ApiResult<Json<Task>> {
    let Json(request) = payload?;
    let task = state
        .manager
        .update_task(&id, &request.worker_id, request.report)
        .await?;
    Ok(Json(task))
}

/// POST /v1/tasks/:id/checkpoints
pub async fn create_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    payload: Result<Json<CheckpointRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Checkpoint>)> {
    let Json(request) = payload?;
    let checkpoint = state
        .manager
        .create_checkpoint(&id, request.worker_id.as_ref(), request.name, request.data)
        .await?;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

/// GET /v1/tasks/:id/checkpoints - full history in sequence order.
pub async fn list_checkpoints(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Vec<Checkpoint>>> {
    Ok(Json(state.manager.get_checkpoints(&id).await?))
}

/// GET /v1/tasks/:id/checkpoints/latest - resume point.
pub async fn latest_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Checkpoint>> {
    Ok(Json(state.manager.latest_checkpoint(&id).await?))
}

/// DELETE /v1/tasks/:id/checkpoints/:sequence
pub async fn delete_checkpoint(
    State(state): State<Arc<AppState>>,
    Path((id, sequence)): Path<(TaskId, u64)>,
) -> ApiResult<StatusCode> {
    state.manager.delete_checkpoint(&id, sequence).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /v1/tasks/:id/checkpoints - drop the whole history.
pub async fn delete_all_checkpoints(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<DeletedCheckpoints>> {
    let deleted = state.manager.delete_all_checkpoints(&id).await?;
    Ok(Json(DeletedCheckpoints { deleted }))
}

/// GET /v1/tasks/:id/progress
pub async fn task_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<TaskProgress>> {
    Ok(Json(state.manager.task_progress(&id).await?))
}

/// GET /v1/tasks/:id/blocking - dependencies that have not completed.
pub async fn blocking_dependencies(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.manager.blocking_dependencies(&id).await?))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.manager.cancel_task(&id).await?))
}

pub async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.manager.pause_task(&id).await?))
}

pub async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.manager.resume_task(&id).await?))
}

/// POST /v1/tasks/:id/assign - operator override of the dispatcher.
pub async fn assign_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    payload: Result<Json<AssignRequest>, JsonRejection>,
) -> ApiResult<Json<Task>> {
    let Json(request) = payload?;
    Ok(Json(state.manager.assign_task(&id, &request.worker_id).await?))
}
