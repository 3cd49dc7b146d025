//! Worker registry - membership, liveness and exclusive assignment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use waypoint_core::{CoreError, CoreResult, TaskId, Worker, WorkerId, WorkerRegistration, WorkerStatus};

use crate::store::{WorkerStore, MAX_CONFLICT_RETRIES};

/// Worker counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub total: usize,
    pub online: usize,
    pub busy: usize,
    pub draining: usize,
    pub offline: usize,
}

/// Owns every mutation of worker records.
pub struct WorkerRegistry {
    store: Arc<dyn WorkerStore>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn WorkerStore>) -> Self {
        Self { store }
    }

    /// Read-modify-write a worker, retrying on version conflicts.
    ///
    /// `apply` returns whether it changed anything; unchanged records are
    /// returned without a write. Errors from `apply` are never retried.
    async fn modify<F>(&self, id: &WorkerId, mut apply: F) -> CoreResult<Worker>
    where
        F: FnMut(&mut Worker) -> CoreResult<bool> + Send,
    {
        let mut attempts = 0;
        loop {
            let mut worker = self.store.get(id).await?;
            if !apply(&mut worker)? {
                return Ok(worker);
            }
            match self.store.update(worker).await {
                Ok(worker) => return Ok(worker),
                Err(e) if e.is_conflict() && attempts < MAX_CONFLICT_RETRIES => {
                    attempts += 1;
                    debug!(worker_id = %id, attempts, "Worker update conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Admit a new worker as `online`.
    pub async fn register(
        &self,
        registration: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> CoreResult<Worker> {
        let worker = self.store.insert(Worker::from_registration(registration, now)).await?;

        info!(
            worker_id = %worker.id,
            hostname = %worker.hostname,
            capabilities = ?worker.capabilities,
            "Worker registered"
        );

        Ok(worker)
    }

    /// Refresh liveness and apply the status the worker reports.
    ///
    /// The control plane stays authoritative: a worker holding a task is
    /// `busy`, draining is sticky, and an offline worker must re-register.
    pub async fn heartbeat(
        &self,
        id: &WorkerId,
        reported: WorkerStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Worker> {
        if reported == WorkerStatus::Offline {
            return Err(CoreError::InvalidInput(
                "workers cannot report offline; deregister instead".to_string(),
            ));
        }

        self.modify(id, |worker| {
            if worker.status == WorkerStatus::Offline {
                return Err(CoreError::WorkerOffline(worker.id.to_string()));
            }

            worker.last_heartbeat_at = now;
            worker.status = if worker.status == WorkerStatus::Draining
                || reported == WorkerStatus::Draining
            {
                WorkerStatus::Draining
            } else if worker.current_task.is_some() {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Online
            };
            Ok(true)
        })
        .await
    }

    /// Remove an idle worker.
    pub async fn deregister(&self, id: &WorkerId) -> CoreResult<Worker> {
        let mut attempts = 0;
        loop {
            let worker = self.store.get(id).await?;
            if worker.current_task.is_some() {
                return Err(CoreError::WorkerBusy(id.to_string()));
            }
            match self.store.remove(id, worker.version).await {
                Ok(worker) => {
                    info!(worker_id = %id, "Worker deregistered");
                    return Ok(worker);
                }
                Err(e) if e.is_conflict() && attempts < MAX_CONFLICT_RETRIES => attempts += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop handing the worker new tasks. In-flight work continues.
    pub async fn drain(&self, id: &WorkerId) -> CoreResult<Worker> {
        let worker = self
            .modify(id, |worker| match worker.status {
                WorkerStatus::Offline => Err(CoreError::WorkerOffline(worker.id.to_string())),
                WorkerStatus::Draining => Ok(false),
                _ => {
                    worker.status = WorkerStatus::Draining;
                    Ok(true)
                }
            })
            .await?;

        info!(worker_id = %id, current_task = ?worker.current_task, "Worker draining");
        Ok(worker)
    }

    /// Exclusively bind `task_id` to the worker: `online -> busy`.
    pub async fn claim(&self, id: &WorkerId, task_id: &TaskId) -> CoreResult<Worker> {
        self.modify(id, |worker| {
            if worker.current_task.is_some() {
                return Err(CoreError::WorkerBusy(worker.id.to_string()));
            }
            match worker.status {
                WorkerStatus::Offline => Err(CoreError::WorkerOffline(worker.id.to_string())),
                WorkerStatus::Online => {
                    worker.current_task = Some(task_id.clone());
                    worker.status = WorkerStatus::Busy;
                    Ok(true)
                }
                status => Err(CoreError::Conflict {
                    kind: "worker",
                    id: worker.id.to_string(),
                    reason: format!("cannot take assignments while {status}"),
                }),
            }
        })
        .await
    }

    /// Unbind `task_id` from the worker. A no-op if the worker holds
    /// something else or nothing.
    pub async fn release(&self, id: &WorkerId, task_id: &TaskId) -> CoreResult<Worker> {
        self.modify(id, |worker| {
            if worker.current_task.as_ref() != Some(task_id) {
                return Ok(false);
            }
            worker.current_task = None;
            if worker.status == WorkerStatus::Busy {
                worker.status = WorkerStatus::Online;
            }
            Ok(true)
        })
        .await
    }

    /// Mark the worker offline if its heartbeat is still expired at `now`.
    ///
    /// Returns the updated worker and the task it was holding, if any. A
    /// worker that heartbeated in the meantime is left alone and `None` is
    /// returned for the task.
    pub async fn mark_offline_if_expired(
        &self,
        id: &WorkerId,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> CoreResult<(Worker, Option<TaskId>)> {
        let mut orphaned = None;
        let worker = self
            .modify(id, |worker| {
                orphaned = None;
                if worker.status == WorkerStatus::Offline || !worker.heartbeat_expired(now, timeout) {
                    return Ok(false);
                }
                orphaned = worker.current_task.take();
                worker.status = WorkerStatus::Offline;
                Ok(true)
            })
            .await?;

        if worker.status == WorkerStatus::Offline && orphaned.is_some() {
            warn!(
                worker_id = %id,
                task_id = ?orphaned,
                last_heartbeat = %worker.last_heartbeat_at,
                "Worker went offline holding a task"
            );
        }

        Ok((worker, orphaned))
    }

    /// Workers not yet offline whose heartbeat is older than `timeout`.
    pub async fn expired(
        &self,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> CoreResult<Vec<Worker>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Offline && w.heartbeat_expired(now, timeout))
            .collect())
    }

    /// Forget offline, idle workers whose last heartbeat is older than
    /// `retention`. A worker that changed since the scan is kept.
    pub async fn evict_offline(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> CoreResult<Vec<WorkerId>> {
        let mut evicted = Vec::new();

        for worker in self.store.list().await? {
            let stale = worker.status == WorkerStatus::Offline
                && worker.current_task.is_none()
                && worker.heartbeat_expired(now, retention);
            if !stale {
                continue;
            }

            match self.store.remove(&worker.id, worker.version).await {
                Ok(_) => {
                    info!(
                        worker_id = %worker.id,
                        last_heartbeat = %worker.last_heartbeat_at,
                        "Evicted offline worker"
                    );
                    evicted.push(worker.id);
                }
                Err(e) if e.is_conflict() => {
                    debug!(worker_id = %worker.id, "Worker changed since scan, not evicted");
                }
                Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(evicted)
    }

    pub async fn get(&self, id: &WorkerId) -> CoreResult<Worker> {
        self.store.get(id).await
    }

    /// All workers ordered by id.
    pub async fn list(&self) -> CoreResult<Vec<Worker>> {
        self.store.list().await
    }

    pub async fn stats(&self) -> CoreResult<WorkerStats> {
        let workers = self.store.list().await?;
        let mut stats = WorkerStats {
            total: workers.len(),
            ..Default::default()
        };
        for worker in &workers {
            match worker.status {
                WorkerStatus::Online => stats.online += 1,
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Draining => stats.draining += 1,
                WorkerStatus::Offline => stats.offline += 1,
            }
        }
        Ok(stats)
    }
}
