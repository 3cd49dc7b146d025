//! Dispatcher - pairs pending tasks with eligible workers and owns the
//! attempt-failed path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::{
    CoreError, CoreResult, LifecycleEvent, Task, TaskFilters, TaskId, TaskState, Worker,
    WorkerId, WorkerStatus,
};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::dependencies::{DependencyResolver, Readiness};
use crate::events::EventBus;
use crate::registry::WorkerRegistry;
use crate::store::{list_all, modify_task, TaskStore};

/// A pairing committed during a dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
}

/// What one dispatch cycle did.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Pairings committed this cycle, in dispatch order.
    pub assigned: Vec<Assignment>,
    /// Pending tasks no live worker could ever run (`CapabilityMismatch`).
    pub unroutable: Vec<CoreError>,
    /// Pending tasks still inside their backoff window.
    pub deferred: usize,
    /// Pending tasks waiting on unfinished dependencies.
    pub blocked: usize,
    /// Pending tasks cancelled because a dependency ended without completing.
    pub abandoned: Vec<TaskId>,
    /// Pairings abandoned after a conflict; retried next cycle.
    pub skipped: usize,
}

/// Task dispatcher.
pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    registry: Arc<WorkerRegistry>,
    events: EventBus,
    backoff: Backoff,
    ack_timeout: chrono::Duration,
    interval: std::time::Duration,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        registry: Arc<WorkerRegistry>,
        events: EventBus,
        config: &Config,
    ) -> Self {
        Self {
            tasks,
            registry,
            events,
            backoff: Backoff::from_config(config),
            ack_timeout: config.ack_timeout(),
            interval: config.dispatch_interval(),
        }
    }

    /// Run one dispatch cycle at `now`.
    ///
    /// Pending tasks are taken oldest first; each goes to the first idle
    /// worker (in id order) whose capabilities cover its type. Tasks whose
    /// dependencies have not all completed are skipped.
    pub async fn dispatch_cycle_at(&self, now: DateTime<Utc>) -> CoreResult<DispatchReport> {
        let mut report = DispatchReport::default();

        let pending = list_all(
            self.tasks.as_ref(),
            TaskFilters::new().with_state(TaskState::Pending),
        )
        .await?;
        if pending.is_empty() {
            return Ok(report);
        }

        let workers = self.registry.list().await?;
        let mut idle: Vec<&Worker> = workers
            .iter()
            .filter(|w| w.status.accepts_assignments() && w.current_task.is_none())
            .collect();

        let mut resolver = DependencyResolver::new(self.tasks.as_ref());

        for task in pending {
            if !task.is_dispatchable(now) {
                report.deferred += 1;
                continue;
            }

            if !task.dependencies.is_empty() {
                match resolver.readiness(&task).await? {
                    Readiness::Ready => {}
                    Readiness::Blocked => {
                        report.blocked += 1;
                        continue;
                    }
                    Readiness::Unsatisfiable { dependency, reason } => {
                        if self.abandon(&task.id, &dependency, &reason, now).await {
                            report.abandoned.push(task.id.clone());
                        }
                        continue;
                    }
                }
            }

            let Some(pos) = idle.iter().position(|w| w.supports(&task.task_type)) else {
                let routable = workers
                    .iter()
                    .any(|w| w.status != WorkerStatus::Offline && w.supports(&task.task_type));
                if !routable {
                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        "No live worker advertises this task type"
                    );
                    report.unroutable.push(CoreError::CapabilityMismatch {
                        task_id: task.id.to_string(),
                        task_type: task.task_type.to_string(),
                    });
                }
                continue;
            };

            let worker_id = idle.remove(pos).id.clone();
            let task_id = task.id.clone();
            match self.pair(task, &worker_id, now).await {
                Ok(_) => report.assigned.push(Assignment { task_id, worker_id }),
                Err(e) => {
                    debug!(
                        task_id = %task_id,
                        worker_id = %worker_id,
                        error = %e,
                        "Pairing abandoned, will retry next cycle"
                    );
                    report.skipped += 1;
                }
            }
        }

        if !report.assigned.is_empty() || !report.abandoned.is_empty() {
            info!(
                assigned = report.assigned.len(),
                deferred = report.deferred,
                blocked = report.blocked,
                abandoned = report.abandoned.len(),
                skipped = report.skipped,
                "Dispatch cycle complete"
            );
        }

        Ok(report)
    }

    /// Assign a specific pending task to a specific worker.
    pub async fn assign(&self, task_id: &TaskId, worker_id: &WorkerId) -> CoreResult<Task> {
        let task = self.tasks.get(task_id).await?;
        let worker = self.registry.get(worker_id).await?;

        if !worker.supports(&task.task_type) {
            return Err(CoreError::CapabilityMismatch {
                task_id: task.id.to_string(),
                task_type: task.task_type.to_string(),
            });
        }
        if worker.status == WorkerStatus::Offline {
            return Err(CoreError::WorkerOffline(worker_id.to_string()));
        }
        if !task.dependencies.is_empty() {
            let readiness = DependencyResolver::new(self.tasks.as_ref()).readiness(&task).await?;
            if readiness != Readiness::Ready {
                return Err(CoreError::Conflict {
                    kind: "task",
                    id: task.id.to_string(),
                    reason: "dependencies have not completed".to_string(),
                });
            }
        }

        self.pair(task, worker_id, Utc::now()).await
    }

    /// Cancel a pending task whose dependency can no longer complete.
    /// Returns whether this call cancelled it.
    async fn abandon(
        &self,
        task_id: &TaskId,
        dependency: &TaskId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let result = modify_task(self.tasks.as_ref(), task_id, |task| {
            if task.state != TaskState::Pending {
                return Ok(false);
            }
            task.cancel(now)?;
            task.error_message = Some(reason.to_string());
            Ok(true)
        })
        .await;

        match result {
            Ok(update) if update.changed => {
                warn!(
                    task_id = %task_id,
                    dependency = %dependency,
                    reason = %reason,
                    "Dependency cannot complete, task cancelled"
                );
                self.events.publish(LifecycleEvent::new(
                    task_id.clone(),
                    update.from,
                    update.task.state,
                ));
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to cancel task with dead dependency");
                false
            }
        }
    }

    /// Pair `task` with `worker_id`: the task update commits first, then the
    /// worker claim.
    ///
    /// The assignment event is published as soon as the task update commits,
    /// so a transition racing the claim is always observed after it. A failed
    /// claim rolls the task back to `pending` without touching `attempt`. If
    /// the task left `assigned` before the claim landed, the worker is
    /// released and the pairing is reported as a conflict.
    async fn pair(&self, mut task: Task, worker_id: &WorkerId, now: DateTime<Utc>) -> CoreResult<Task> {
        let from = task.state;
        task.assign(worker_id.clone(), now)?;
        let task = self.tasks.update(task).await?;
        self.events.publish(
            LifecycleEvent::new(task.id.clone(), from, task.state).with_worker(Some(worker_id.clone())),
        );

        if let Err(e) = self.registry.claim(worker_id, &task.id).await {
            warn!(
                task_id = %task.id,
                worker_id = %worker_id,
                error = %e,
                "Worker claim failed, rolling back assignment"
            );
            self.rollback(&task.id, worker_id).await;
            return Err(e);
        }

        let current = match self.tasks.get(&task.id).await {
            Ok(current) => current,
            Err(e) => {
                self.release_claim(&task.id, worker_id).await;
                return Err(e);
            }
        };
        // The worker may already have acked; only a lost hold matters.
        if current.assigned_worker.as_ref() != Some(worker_id) {
            info!(
                task_id = %task.id,
                worker_id = %worker_id,
                state = %current.state,
                "Task moved on before the worker claim, releasing worker"
            );
            self.release_claim(&task.id, worker_id).await;
            return Err(CoreError::Conflict {
                kind: "task",
                id: task.id.to_string(),
                reason: format!("became {} while the worker was claimed", current.state),
            });
        }

        info!(
            task_id = %current.id,
            worker_id = %worker_id,
            task_type = %current.task_type,
            attempt = current.attempt,
            "Assigned task to worker"
        );

        Ok(current)
    }

    async fn release_claim(&self, task_id: &TaskId, worker_id: &WorkerId) {
        if let Err(e) = self.registry.release(worker_id, task_id).await {
            debug!(worker_id = %worker_id, error = %e, "Worker not released");
        }
    }

    async fn rollback(&self, task_id: &TaskId, worker_id: &WorkerId) {
        let result = modify_task(self.tasks.as_ref(), task_id, |task| {
            if task.state != TaskState::Assigned || task.assigned_worker.as_ref() != Some(worker_id) {
                return Ok(false);
            }
            task.unassign()?;
            Ok(true)
        })
        .await;

        match result {
            Ok(update) if update.changed => {
                self.events.publish(
                    LifecycleEvent::new(task_id.clone(), update.from, update.task.state)
                        .with_worker(Some(worker_id.clone())),
                );
            }
            Ok(_) => {}
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to roll back assignment"),
        }
    }

    /// Record a failed attempt for a task held by `worker_id`.
    ///
    /// The task returns to `pending` behind a backoff window, or fails
    /// permanently once its attempts are spent. The worker is released either
    /// way. Returns `None` if the task is no longer held by that worker.
    pub async fn handle_attempt_failed(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Task>> {
        let backoff = self.backoff;
        let update = modify_task(self.tasks.as_ref(), task_id, |task| {
            if task.assigned_worker.as_ref() != Some(worker_id) {
                return Ok(false);
            }
            let retry_at = backoff.retry_at(task.attempt + 1, now);
            task.fail_attempt(reason, now, retry_at)?;
            Ok(true)
        })
        .await?;

        self.release_claim(task_id, worker_id).await;

        if !update.changed {
            debug!(
                task_id = %task_id,
                worker_id = %worker_id,
                state = %update.task.state,
                "Attempt failure ignored, task no longer held by worker"
            );
            return Ok(None);
        }

        let task = update.task;
        if task.state == TaskState::Failed {
            warn!(
                task_id = %task.id,
                worker_id = %worker_id,
                attempt = task.attempt,
                reason = %reason,
                "Task failed permanently"
            );
        } else {
            info!(
                task_id = %task.id,
                worker_id = %worker_id,
                attempt = task.attempt,
                not_before = ?task.not_before,
                reason = %reason,
                "Task released for retry"
            );
        }

        self.events.publish(
            LifecycleEvent::new(task.id.clone(), update.from, task.state)
                .with_worker(Some(worker_id.clone())),
        );

        Ok(Some(task))
    }

    /// Fail assignments that were not acknowledged within the ack timeout.
    pub async fn expire_unacked_at(&self, now: DateTime<Utc>) -> CoreResult<Vec<TaskId>> {
        let assigned = list_all(
            self.tasks.as_ref(),
            TaskFilters::new().with_state(TaskState::Assigned),
        )
        .await?;

        let mut expired = Vec::new();
        for task in assigned {
            let overdue = task
                .assigned_at
                .is_some_and(|at| now.signed_duration_since(at) > self.ack_timeout);
            let Some(worker_id) = task.assigned_worker.as_ref().filter(|_| overdue) else {
                continue;
            };

            let reason = format!(
                "assignment not acknowledged within {}s",
                self.ack_timeout.num_seconds()
            );
            match self.handle_attempt_failed(&task.id, worker_id, &reason, now).await {
                Ok(Some(_)) => expired.push(task.id.clone()),
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to expire assignment"),
            }
        }

        Ok(expired)
    }

    /// Fail the attempt of any task still held by a worker that is offline
    /// or no longer registered. Catches reclaims a previous sweep could not
    /// finish.
    pub async fn reclaim_orphans_at(&self, now: DateTime<Utc>) -> CoreResult<Vec<TaskId>> {
        let mut reclaimed = Vec::new();

        for state in [TaskState::Assigned, TaskState::Running, TaskState::Paused] {
            let held = list_all(self.tasks.as_ref(), TaskFilters::new().with_state(state)).await?;
            for task in held {
                let Some(worker_id) = task.assigned_worker.as_ref() else {
                    continue;
                };
                let gone = match self.registry.get(worker_id).await {
                    Ok(worker) => worker.status == WorkerStatus::Offline,
                    Err(CoreError::NotFound { .. }) => true,
                    Err(e) => return Err(e),
                };
                if !gone {
                    continue;
                }

                let reason = format!("worker {worker_id} is gone");
                match self.handle_attempt_failed(&task.id, worker_id, &reason, now).await {
                    Ok(Some(_)) => reclaimed.push(task.id.clone()),
                    Ok(None) => {}
                    Err(e) => warn!(task_id = %task.id, error = %e, "Failed to reclaim orphaned task"),
                }
            }
        }

        Ok(reclaimed)
    }

    /// Dispatch loop. Runs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "Dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.dispatch_cycle_at(now).await {
                        warn!(error = %e, "Dispatch cycle failed");
                    }
                    if let Err(e) = self.expire_unacked_at(now).await {
                        warn!(error = %e, "Ack timeout scan failed");
                    }
                }
            }
        }

        info!("Dispatcher stopped");
    }
}
