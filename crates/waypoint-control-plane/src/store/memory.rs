//! In-memory store implementations.
//!
//! Owned tables behind `tokio::sync::RwLock`. Used by default and as test
//! fakes.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use waypoint_core::filter::listing_key;
use waypoint_core::{
    Checkpoint, CoreError, CoreResult, Task, TaskFilters, TaskId, Worker, WorkerId,
};

use super::{CheckpointStore, TaskStore, WorkerStore};

pub(super) fn version_conflict(kind: &'static str, id: impl ToString, expected: u64, actual: u64) -> CoreError {
    CoreError::Conflict {
        kind,
        id: id.to_string(),
        reason: format!("expected version {expected}, found {actual}"),
    }
}

/// Task table.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, mut task: Task) -> CoreResult<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(CoreError::DuplicateId {
                kind: "task",
                id: task.id.to_string(),
            });
        }
        task.version = 1;
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> CoreResult<Task> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::task_not_found(id))
    }

    async fn update(&self, mut task: Task) -> CoreResult<Task> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(&task.id)
            .ok_or_else(|| CoreError::task_not_found(&task.id))?;

        if stored.version != task.version {
            return Err(version_conflict("task", &task.id, task.version, stored.version));
        }

        task.version += 1;
        task.updated_at = Utc::now();
        *stored = task.clone();
        Ok(task)
    }

    async fn list(&self, filters: &TaskFilters) -> CoreResult<Vec<Task>> {
        Ok(select_page(&*self.tasks.read().await, filters))
    }
}

/// One listing page out of a task table, ordered by `(created_at, id)`.
pub(super) fn select_page(tasks: &HashMap<TaskId, Task>, filters: &TaskFilters) -> Vec<Task> {
    // Resolve the cursor to its sort key; an unknown cursor yields nothing.
    let cursor = match &filters.after {
        Some(id) => match tasks.get(id) {
            Some(task) => Some((task.created_at, task.id.clone())),
            None => return Vec::new(),
        },
        None => None,
    };

    let mut page: Vec<&Task> = tasks
        .values()
        .filter(|task| filters.matches(task))
        .filter(|task| match &cursor {
            Some((at, id)) => listing_key(task) > (*at, id),
            None => true,
        })
        .collect();

    page.sort_by(|a, b| listing_key(a).cmp(&listing_key(b)));
    page.truncate(filters.page_size());

    page.into_iter().cloned().collect()
}

#[derive(Default)]
struct History {
    /// Last sequence handed out; survives deletions.
    last: u64,
    entries: BTreeMap<u64, Checkpoint>,
}

/// Checkpoint history keyed by task, held in sequence order.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<TaskId, History>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(
        &self,
        task_id: &TaskId,
        name: Option<String>,
        data: Value,
    ) -> CoreResult<Checkpoint> {
        let mut checkpoints = self.checkpoints.write().await;
        let history = checkpoints.entry(task_id.clone()).or_default();
        history.last += 1;
        let sequence = history.last;

        let checkpoint = Checkpoint::new(task_id.clone(), sequence, name, data);
        history.entries.insert(sequence, checkpoint.clone());
        Ok(checkpoint)
    }

    async fn latest(&self, task_id: &TaskId) -> CoreResult<Checkpoint> {
        self.checkpoints
            .read()
            .await
            .get(task_id)
            .and_then(|history| history.entries.values().next_back().cloned())
            .ok_or_else(|| CoreError::checkpoint_not_found(task_id))
    }

    async fn list(&self, task_id: &TaskId) -> CoreResult<Vec<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(task_id)
            .map(|history| history.entries.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, task_id: &TaskId, sequence: u64) -> CoreResult<()> {
        self.checkpoints
            .write()
            .await
            .get_mut(task_id)
            .and_then(|history| history.entries.remove(&sequence))
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound {
                kind: "checkpoint",
                id: format!("{task_id}#{sequence}"),
            })
    }

    async fn delete_all(&self, task_id: &TaskId) -> CoreResult<usize> {
        let mut checkpoints = self.checkpoints.write().await;
        Ok(checkpoints.get_mut(task_id).map_or(0, |history| {
            let removed = history.entries.len();
            history.entries.clear();
            removed
        }))
    }
}

/// Worker table.
#[derive(Default)]
pub struct InMemoryWorkerStore {
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl InMemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerStore for InMemoryWorkerStore {
    async fn insert(&self, mut worker: Worker) -> CoreResult<Worker> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker.id) {
            return Err(CoreError::DuplicateId {
                kind: "worker",
                id: worker.id.to_string(),
            });
        }
        worker.version = 1;
        workers.insert(worker.id.clone(), worker.clone());
        Ok(worker)
    }

    async fn get(&self, id: &WorkerId) -> CoreResult<Worker> {
        self.workers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::worker_not_found(id))
    }

    async fn update(&self, mut worker: Worker) -> CoreResult<Worker> {
        let mut workers = self.workers.write().await;
        let stored = workers
            .get_mut(&worker.id)
            .ok_or_else(|| CoreError::worker_not_found(&worker.id))?;

        if stored.version != worker.version {
            return Err(version_conflict("worker", &worker.id, worker.version, stored.version));
        }

        worker.version += 1;
        *stored = worker.clone();
        Ok(worker)
    }

    async fn remove(&self, id: &WorkerId, version: u64) -> CoreResult<Worker> {
        let mut workers = self.workers.write().await;
        let stored = workers.get(id).ok_or_else(|| CoreError::worker_not_found(id))?;
        if stored.version != version {
            return Err(version_conflict("worker", id, version, stored.version));
        }
        workers.remove(id).ok_or_else(|| CoreError::worker_not_found(id))
    }

    async fn list(&self) -> CoreResult<Vec<Worker>> {
        let mut workers: Vec<Worker> = self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }
}
