//! Task record and its lifecycle transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, CoreResult, TaskId, TaskState, WorkerId};

/// Default number of dispatch attempts before a task fails permanently.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Kind of work a task represents.
///
/// Opaque to the control plane beyond routing: a worker can run a task iff
/// its capability set contains the task type tag.
///
/// Tags are normalized on every construction path, including deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    pub const PLANNING: &'static str = "planning";
    pub const BUILD: &'static str = "build";
    pub const TEST: &'static str = "test";
    pub const DEPLOY: &'static str = "deploy";

    /// Create a task type tag. Tags are case-insensitive and stored lowercase.
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for TaskType {
    fn from(tag: String) -> Self {
        Self::new(tag)
    }
}

impl From<TaskType> for String {
    fn from(tag: TaskType) -> Self {
        tag.0
    }
}

/// A Task is a unit of work tracked through the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Routing tag matched against worker capabilities.
    pub task_type: TaskType,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Principal that submitted the task (opaque).
    pub owner: String,

    /// Input handed to the worker (opaque).
    pub payload: Value,

    /// Tasks that must complete before this one is dispatched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TaskId>,

    /// Worker currently responsible for the task.
    pub assigned_worker: Option<WorkerId>,

    /// Failed dispatch attempts so far. Never decreases.
    pub attempt: u32,

    /// Attempts allowed before the task fails permanently.
    pub max_attempts: u32,

    /// Last result payload reported by a worker.
    pub result: Option<Value>,

    /// Last failure reason.
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Earliest time the dispatcher may hand this task out again.
    pub not_before: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: u64,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(task_type: impl Into<TaskType>, owner: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            task_type: task_type.into(),
            state: TaskState::Pending,
            owner: owner.into(),
            payload,
            dependencies: Vec::new(),
            assigned_worker: None,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: None,
            assigned_at: None,
            started_at: None,
            finished_at: None,
            not_before: None,
            version: 0,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to override the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Builder method to gate dispatch on other tasks. Duplicates are dropped.
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        for dep in dependencies {
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    /// Builder method to pin the creation time.
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the dispatcher may consider this task at `now`.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    /// Pair with a worker: `pending -> assigned`.
    pub fn assign(&mut self, worker_id: WorkerId, now: DateTime<Utc>) -> CoreResult<()> {
        self.state.ensure_transition(TaskState::Assigned)?;
        self.state = TaskState::Assigned;
        self.assigned_worker = Some(worker_id);
        self.assigned_at = Some(now);
        self.not_before = None;
        Ok(())
    }

    /// Undo a pairing whose worker side failed: `assigned -> pending`.
    ///
    /// Not a failed attempt, so `attempt` is untouched.
    pub fn unassign(&mut self) -> CoreResult<()> {
        if self.state != TaskState::Assigned {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: TaskState::Pending,
            });
        }
        self.state = TaskState::Pending;
        self.assigned_worker = None;
        self.assigned_at = None;
        Ok(())
    }

    /// Worker acknowledged the assignment: `assigned -> running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.state.ensure_transition(TaskState::Running)?;
        if self.state != TaskState::Assigned {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: TaskState::Running,
            });
        }
        self.state = TaskState::Running;
        self.started_at.get_or_insert(now);
        self.last_heartbeat_at = Some(now);
        Ok(())
    }

    /// `running -> paused`.
    pub fn pause(&mut self) -> CoreResult<()> {
        if self.state != TaskState::Running {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: TaskState::Paused,
            });
        }
        self.state = TaskState::Paused;
        Ok(())
    }

    /// `paused -> running`.
    pub fn resume(&mut self) -> CoreResult<()> {
        if self.state != TaskState::Paused {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: TaskState::Running,
            });
        }
        self.state = TaskState::Running;
        Ok(())
    }

    /// `running -> completed`. Clears the worker reference.
    pub fn complete(&mut self, result: Option<Value>, now: DateTime<Utc>) -> CoreResult<()> {
        self.state.ensure_transition(TaskState::Completed)?;
        self.state = TaskState::Completed;
        self.result = result;
        self.assigned_worker = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Any non-terminal state `-> cancelled`. Clears the worker reference.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.state.ensure_transition(TaskState::Cancelled)?;
        self.state = TaskState::Cancelled;
        self.assigned_worker = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Increments `attempt`, then either releases the task back to `pending`
    /// (gated by `retry_at`) or fails it permanently once the budget is spent.
    /// Returns the resulting state.
    pub fn fail_attempt(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> CoreResult<TaskState> {
        if !self.state.holds_worker() {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: TaskState::Failed,
            });
        }

        self.attempt += 1;
        self.assigned_worker = None;
        self.assigned_at = None;

        if self.attempt < self.max_attempts {
            self.state = TaskState::Pending;
            self.error_message = Some(reason.into());
            self.not_before = Some(retry_at);
        } else {
            let exhausted = CoreError::RetriesExhausted {
                task_id: self.id.to_string(),
                attempts: self.attempt,
            };
            self.state = TaskState::Failed;
            self.error_message = Some(format!("{exhausted}: {}", reason.into()));
            self.not_before = None;
            self.finished_at = Some(now);
        }

        Ok(self.state)
    }

    /// Verify the record-level invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.state.holds_worker() != self.assigned_worker.is_some() {
            return Err(format!(
                "task {} in state {} has assigned_worker={:?}",
                self.id, self.state, self.assigned_worker
            ));
        }
        if self.attempt > self.max_attempts {
            return Err(format!(
                "task {} attempt {} exceeds max_attempts {}",
                self.id, self.attempt, self.max_attempts
            ));
        }
        Ok(())
    }
}
