//! Lifecycle states for Tasks and Workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Lifecycle state of a Task.
///
/// ```text
/// pending -> assigned -> running <-> paused
///                           \-> completed
/// assigned | running | paused -> failed
/// any non-terminal -> cancelled
/// ```
///
/// `assigned | running | paused -> pending` is the release edge taken by the
/// dispatcher when an attempt fails but retries remain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker.
    #[default]
    Pending,
    /// Paired with a worker, awaiting its acknowledgment.
    Assigned,
    /// Worker acknowledged and is executing.
    Running,
    /// Execution suspended; the worker keeps the assignment.
    Paused,
    /// Finished successfully.
    Completed,
    /// Failed permanently.
    Failed,
    /// Cancelled by a user or the system.
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Pending,
        TaskState::Assigned,
        TaskState::Running,
        TaskState::Paused,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Returns true if no further transitions are permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a task in this state must reference a worker.
    pub fn holds_worker(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running | Self::Paused)
    }

    /// Whether `self -> to` is an edge of the lifecycle state machine.
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;

        match (*self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Pending, Assigned) => true,
            (Assigned, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) => true,
            (Assigned | Running | Paused, Failed) => true,
            (Assigned | Running | Paused, Pending) => true,
            _ => false,
        }
    }

    /// Validate `self -> to`, producing `InvalidTransition` when illegal.
    pub fn ensure_transition(&self, to: TaskState) -> Result<(), CoreError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition { from: *self, to })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown task state '{s}'")))
    }
}

/// Liveness/availability of a Worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Idle and eligible for new assignments.
    #[default]
    Online,
    /// Executing its current task.
    Busy,
    /// Missed heartbeats; must re-register.
    Offline,
    /// Finishing in-flight work, not accepting new assignments.
    Draining,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Online,
        WorkerStatus::Busy,
        WorkerStatus::Offline,
        WorkerStatus::Draining,
    ];

    /// Returns true if the dispatcher may hand this worker a task.
    pub fn accepts_assignments(&self) -> bool {
        matches!(self, Self::Online)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
            Self::Draining => "draining",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown worker status '{s}'")))
    }
}
