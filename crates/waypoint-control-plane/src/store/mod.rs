//! Storage contracts for tasks, checkpoints and workers.
//!
//! The control plane depends only on these traits. Every write is atomic at
//! single-record granularity; there are no cross-record transactions. Errors
//! are surfaced verbatim and never retried at this layer.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use waypoint_core::{
    Checkpoint, CoreResult, Task, TaskFilters, TaskId, TaskState, Worker, WorkerId,
};

mod file;
mod memory;

pub use file::{FileCheckpointStore, FileTaskStore};
pub use memory::{InMemoryCheckpointStore, InMemoryTaskStore, InMemoryWorkerStore};

/// Optimistic updates are retried this many times before the conflict surfaces.
pub(crate) const MAX_CONFLICT_RETRIES: usize = 8;

/// Durable task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `DuplicateId` if the id exists.
    async fn create(&self, task: Task) -> CoreResult<Task>;

    /// Fetch a task. Fails with `NotFound` if absent.
    async fn get(&self, id: &TaskId) -> CoreResult<Task>;

    /// Replace a task if `task.version` matches the stored version.
    ///
    /// Fails with `Conflict` when the record changed since it was read.
    /// Returns the stored record with its new version.
    async fn update(&self, task: Task) -> CoreResult<Task>;

    /// One page of tasks matching `filters`, ordered by `(created_at, id)`.
    async fn list(&self, filters: &TaskFilters) -> CoreResult<Vec<Task>>;
}

/// Append-only checkpoint history per task.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint and return it with its assigned sequence.
    ///
    /// The checkpoint is durable once this returns.
    async fn append(&self, task_id: &TaskId, name: Option<String>, data: Value)
        -> CoreResult<Checkpoint>;

    /// Highest-sequence checkpoint. Fails with `NotFound` if none exists.
    async fn latest(&self, task_id: &TaskId) -> CoreResult<Checkpoint>;

    /// Full history in sequence order (empty when none).
    async fn list(&self, task_id: &TaskId) -> CoreResult<Vec<Checkpoint>>;

    /// Remove one checkpoint. Fails with `NotFound` if it does not exist.
    ///
    /// Deleted sequences are never handed out again.
    async fn delete(&self, task_id: &TaskId, sequence: u64) -> CoreResult<()>;

    /// Remove the whole history and return how many checkpoints it held.
    async fn delete_all(&self, task_id: &TaskId) -> CoreResult<usize>;
}

/// Worker records.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Insert a new worker. Fails with `DuplicateId` if the id exists.
    async fn insert(&self, worker: Worker) -> CoreResult<Worker>;

    /// Fetch a worker. Fails with `NotFound` if absent.
    async fn get(&self, id: &WorkerId) -> CoreResult<Worker>;

    /// Versioned replace, same contract as [`TaskStore::update`].
    async fn update(&self, worker: Worker) -> CoreResult<Worker>;

    /// Remove a worker if `version` matches. Fails with `NotFound` or `Conflict`.
    async fn remove(&self, id: &WorkerId, version: u64) -> CoreResult<Worker>;

    /// All workers ordered by id.
    async fn list(&self) -> CoreResult<Vec<Worker>>;
}

/// Outcome of [`modify_task`].
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    /// State before the mutation was applied.
    pub from: TaskState,
    /// The stored record (unchanged when `changed` is false).
    pub task: Task,
    pub changed: bool,
}

/// Read-modify-write a task, retrying on version conflicts.
///
/// `apply` returns whether it changed anything; unchanged records are not
/// written. Errors from `apply` are returned as-is.
pub async fn modify_task<F>(store: &dyn TaskStore, id: &TaskId, mut apply: F) -> CoreResult<TaskUpdate>
where
    F: FnMut(&mut Task) -> CoreResult<bool> + Send,
{
    let mut attempts = 0;
    loop {
        let mut task = store.get(id).await?;
        let from = task.state;
        if !apply(&mut task)? {
            return Ok(TaskUpdate {
                from,
                task,
                changed: false,
            });
        }
        match store.update(task).await {
            Ok(task) => {
                return Ok(TaskUpdate {
                    from,
                    task,
                    changed: true,
                })
            }
            Err(e) if e.is_conflict() && attempts < MAX_CONFLICT_RETRIES => {
                attempts += 1;
                debug!(task_id = %id, attempts, "Task update conflicted, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drain every page of a listing.
pub async fn list_all(store: &dyn TaskStore, mut filters: TaskFilters) -> CoreResult<Vec<Task>> {
    let mut all = Vec::new();
    loop {
        let page = store.list(&filters).await?;
        let cursor = if page.len() >= filters.page_size() {
            page.last().map(|task| task.id.clone())
        } else {
            None
        };
        all.extend(page);
        match cursor {
            Some(cursor) => filters.after = Some(cursor),
            None => return Ok(all),
        }
    }
}
