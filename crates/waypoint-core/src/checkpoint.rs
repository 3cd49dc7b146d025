//! Checkpoint snapshots of resumable task progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TaskId;

/// An immutable snapshot of a task's progress.
///
/// `sequence` is assigned by the checkpoint store: strictly increasing per
/// task and never reused, though gaps may appear after failed writes. The
/// highest sequence is the resume point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning task.
    pub task_id: TaskId,

    /// Per-task sequence number.
    pub sequence: u64,

    /// Optional label supplied by the worker (e.g. "after-compile").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Opaque resumable state.
    pub data: Value,

    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: TaskId, sequence: u64, name: Option<String>, data: Value) -> Self {
        Self {
            task_id,
            sequence,
            name,
            data,
            created_at: Utc::now(),
        }
    }
}
