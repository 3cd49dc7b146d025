//! Lifecycle events emitted on every committed task transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TaskId, TaskState, WorkerId};

/// A committed `from -> to` transition of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Task that transitioned.
    pub task_id: TaskId,
    /// State before the transition.
    pub from: TaskState,
    /// State after the transition.
    pub to: TaskState,
    /// When the transition was committed.
    pub timestamp: DateTime<Utc>,
    /// Worker involved in the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
}

impl LifecycleEvent {
    /// Create a new lifecycle event stamped with the current time.
    pub fn new(task_id: TaskId, from: TaskState, to: TaskState) -> Self {
        Self {
            task_id,
            from,
            to,
            timestamp: Utc::now(),
            worker_id: None,
        }
    }

    /// Builder method to attach the worker involved.
    pub fn with_worker(mut self, worker_id: Option<WorkerId>) -> Self {
        self.worker_id = worker_id;
        self
    }

    /// Whether this event moved the task into a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_states_lowercase() {
        let event = LifecycleEvent::new(TaskId::new("t1"), TaskState::Pending, TaskState::Assigned)
            .with_worker(Some(WorkerId::new("w1")));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["from"], "pending");
        assert_eq!(json["to"], "assigned");
        assert_eq!(json["worker_id"], "w1");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_terminal_event() {
        let event = LifecycleEvent::new(TaskId::new("t1"), TaskState::Running, TaskState::Completed);
        assert!(event.is_terminal());
        assert!(event.worker_id.is_none());
    }
}
