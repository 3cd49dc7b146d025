//! Core domain errors.

use thiserror::Error;

use crate::TaskState;

/// Result alias used across Waypoint crates.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error taxonomy shared by the stores, the dispatcher and the task manager.
///
/// Store-level errors (`NotFound`, `DuplicateId`, `Conflict`) are surfaced
/// verbatim to callers; the stores never retry on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Referenced task, worker or checkpoint does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A record with this identifier already exists.
    #[error("{kind} already exists: {id}")]
    DuplicateId { kind: &'static str, id: String },

    /// Optimistic update lost a race; re-read and retry.
    #[error("Conflicting update on {kind} {id}: {reason}")]
    Conflict {
        kind: &'static str,
        id: String,
        reason: String,
    },

    /// Requested state change is not permitted from the current state.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    /// Worker holds a task and cannot be removed or claimed.
    #[error("Worker {0} is busy")]
    WorkerBusy(String),

    /// Worker was marked offline and must register again.
    #[error("Worker {0} is offline; re-register to continue")]
    WorkerOffline(String),

    /// No eligible worker can run this task type.
    #[error("No worker with capability '{task_type}' for task {task_id}")]
    CapabilityMismatch { task_id: String, task_type: String },

    /// Task failed permanently after exhausting its attempts.
    #[error("Task {task_id} exhausted {attempts} attempts")]
    RetriesExhausted { task_id: String, attempts: u32 },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage backend failure (I/O, serialization).
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn task_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    pub fn worker_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "worker",
            id: id.to_string(),
        }
    }

    pub fn checkpoint_not_found(task_id: impl ToString) -> Self {
        Self::NotFound {
            kind: "checkpoint",
            id: task_id.to_string(),
        }
    }

    /// True when the caller should re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
