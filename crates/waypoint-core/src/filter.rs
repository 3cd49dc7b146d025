//! Filters and paging cursor for task listings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Task, TaskId, TaskState, TaskType};

/// Default page size for task listings.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Filters for listing tasks.
///
/// Listings are ordered by `(created_at, id)` ascending. `after` is a
/// restartable cursor: pass the id of the last task of the previous page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,

    /// Inclusive lower bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,

    /// Exclusive upper bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl TaskFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_type(mut self, task_type: impl Into<TaskType>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn after(mut self, cursor: TaskId) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Effective page size.
    pub fn page_size(&self) -> usize {
        self.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Whether `task` satisfies every predicate (the cursor is not a predicate).
    pub fn matches(&self, task: &Task) -> bool {
        if self.state.is_some_and(|s| s != task.state) {
            return false;
        }
        if self.owner.as_ref().is_some_and(|o| *o != task.owner) {
            return false;
        }
        if self.task_type.as_ref().is_some_and(|t| *t != task.task_type) {
            return false;
        }
        if self.created_after.is_some_and(|t| task.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| task.created_at >= t) {
            return false;
        }
        true
    }
}

/// Sort key used for every task listing.
pub fn listing_key(task: &Task) -> (DateTime<Utc>, &TaskId) {
    (task.created_at, &task.id)
}
