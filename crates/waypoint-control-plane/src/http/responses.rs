//! HTTP request and response types.
//!
//! Domain records (`Task`, `Worker`, `Checkpoint`) are serialized as-is;
//! this module only holds the envelopes around them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use waypoint_core::{TaskId, WorkerId, WorkerStatus};

use crate::manager::TaskReport;

// ============================================================================
// Task types
// ============================================================================

/// Request body for `POST /v1/tasks/:id/report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub worker_id: WorkerId,

    #[serde(flatten)]
    pub report: TaskReport,
}

/// Request body for `POST /v1/tasks/:id/checkpoints`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRequest {
    /// Reporting worker; must hold the task when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub data: Value,
}

/// Response body for `DELETE /v1/tasks/:id/checkpoints`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedCheckpoints {
    pub deleted: usize,
}

/// Request body for `POST /v1/tasks/:id/assign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub worker_id: WorkerId,
}

// ============================================================================
// Worker types
// ============================================================================

/// Request body for `POST /v1/workers/:id/heartbeat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: WorkerStatus,
}

// ============================================================================
// Event types
// ============================================================================

/// Query string for `GET /v1/events`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    /// Only stream transitions of this task.
    pub task_id: Option<TaskId>,
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
