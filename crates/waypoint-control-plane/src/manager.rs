//! Task manager - the façade every client and worker request goes through.

use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use waypoint_core::{
    Checkpoint, CoreError, CoreResult, LifecycleEvent, Task, TaskFilters, TaskId, TaskState,
    TaskType, Worker, WorkerId, WorkerRegistration, WorkerStatus,
};

use crate::dependencies;
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::registry::{WorkerRegistry, WorkerStats};
use crate::store::{modify_task, CheckpointStore, TaskStore, TaskUpdate};

/// Request to submit a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub owner: String,
    #[serde(default)]
    pub payload: Value,
    /// Overrides the configured attempt budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Tasks that must complete before this one is dispatched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TaskId>,
}

/// Progress a worker reports for the task it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskReport {
    /// Assignment acknowledged; execution started.
    Running,
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Failed {
        error: String,
    },
}

impl TaskReport {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One page of a task listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Pass as `after` to fetch the next page; absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<TaskId>,
}

/// Where a task stands, for progress displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Coarse estimate: 100 once completed, 50 while executing, 0 otherwise.
    pub percent: u8,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_checkpoint: Option<Checkpoint>,
    /// Dependencies that have not completed yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<TaskId>,
}

fn percent_done(state: TaskState) -> u8 {
    match state {
        TaskState::Completed => 100,
        TaskState::Running | TaskState::Paused => 50,
        _ => 0,
    }
}

/// What the control plane wants the worker to do with its current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Continue,
    Pause,
    Stop,
}

/// A task handed to a worker, with the checkpoint to resume from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<Checkpoint>,
}

/// Response to a worker heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub worker: Worker,
    pub directive: Directive,
    /// Present while the worker's task awaits acknowledgment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<WorkAssignment>,
}

fn not_held(task: &Task, worker_id: &WorkerId) -> CoreError {
    CoreError::Conflict {
        kind: "task",
        id: task.id.to_string(),
        reason: format!("not held by worker {worker_id}"),
    }
}

/// Task manager.
pub struct TaskManager {
    tasks: Arc<dyn TaskStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    default_max_attempts: u32,
}

impl TaskManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            tasks,
            checkpoints,
            registry,
            dispatcher,
            events,
            default_max_attempts,
        }
    }

    fn publish(&self, update: &TaskUpdate, worker_id: Option<WorkerId>) {
        if update.changed && update.from != update.task.state {
            self.events.publish(
                LifecycleEvent::new(update.task.id.clone(), update.from, update.task.state)
                    .with_worker(worker_id),
            );
        }
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Submit a task. It starts `pending` and is not dispatched before its
    /// dependencies complete.
    pub async fn create_task(&self, request: NewTask) -> CoreResult<Task> {
        if request.task_type.is_empty() {
            return Err(CoreError::InvalidInput("task type must not be empty".to_string()));
        }

        let task = Task::new(request.task_type, request.owner, request.payload)
            .with_max_attempts(request.max_attempts.unwrap_or(self.default_max_attempts))
            .with_dependencies(request.dependencies);
        dependencies::validate(self.tasks.as_ref(), &task.id, &task.dependencies).await?;
        let task = self.tasks.create(task).await?;

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            owner = %task.owner,
            max_attempts = task.max_attempts,
            dependencies = task.dependencies.len(),
            "Task created"
        );

        Ok(task)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> CoreResult<Task> {
        self.tasks.get(task_id).await
    }

    /// Dependencies of a task that have not completed yet.
    pub async fn blocking_dependencies(&self, task_id: &TaskId) -> CoreResult<Vec<Task>> {
        let task = self.tasks.get(task_id).await?;
        dependencies::blocking(self.tasks.as_ref(), &task).await
    }

    pub async fn task_progress(&self, task_id: &TaskId) -> CoreResult<TaskProgress> {
        let task = self.tasks.get(task_id).await?;
        let latest_checkpoint = match self.checkpoints.latest(task_id).await {
            Ok(checkpoint) => Some(checkpoint),
            Err(CoreError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let blocked_by = if task.state == TaskState::Pending {
            dependencies::blocking(self.tasks.as_ref(), &task)
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect()
        } else {
            Vec::new()
        };

        Ok(TaskProgress {
            percent: percent_done(task.state),
            task_id: task.id,
            state: task.state,
            attempt: task.attempt,
            max_attempts: task.max_attempts,
            latest_checkpoint,
            blocked_by,
        })
    }

    /// One page of tasks, ordered by creation time.
    pub async fn list_tasks(&self, filters: &TaskFilters) -> CoreResult<TaskPage> {
        let tasks = self.tasks.list(filters).await?;
        let next_cursor = if tasks.len() >= filters.page_size() {
            tasks.last().map(|t| t.id.clone())
        } else {
            None
        };
        Ok(TaskPage { tasks, next_cursor })
    }

    /// Every matching task as a lazy stream, fetched page by page.
    ///
    /// Restartable: set `filters.after` to the last id seen.
    pub fn stream_tasks(&self, filters: TaskFilters) -> impl Stream<Item = CoreResult<Task>> + Send + 'static {
        let store = self.tasks.clone();

        stream::unfold(Some(filters), move |cursor| {
            let store = store.clone();
            async move {
                let mut filters = cursor?;
                match store.list(&filters).await {
                    Ok(page) => {
                        let next = if page.len() >= filters.page_size() {
                            page.last().map(|t| t.id.clone())
                        } else {
                            None
                        };
                        let cursor = next.map(|after| {
                            filters.after = Some(after);
                            filters
                        });
                        Some((Ok(page), cursor))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
        .flat_map(|page| {
            let items: Vec<CoreResult<Task>> = match page {
                Ok(tasks) => tasks.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
    }

    /// Apply a worker's report for the task it holds.
    ///
    /// Reports for a task that already reached a terminal state (typically a
    /// cancel racing the worker) are accepted and leave the task untouched;
    /// a terminal report releases the worker.
    pub async fn update_task(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        report: TaskReport,
    ) -> CoreResult<Task> {
        let now = Utc::now();

        let update = match &report {
            TaskReport::Failed { error } => {
                let task = self.tasks.get(task_id).await?;
                if task.is_terminal() {
                    return self.accept_late_report(task, worker_id, &report).await;
                }
                if task.assigned_worker.as_ref() != Some(worker_id) {
                    return Err(not_held(&task, worker_id));
                }
                // Events and worker release happen on the failure path.
                return match self
                    .dispatcher
                    .handle_attempt_failed(task_id, worker_id, error, now)
                    .await?
                {
                    Some(task) => Ok(task),
                    None => self.tasks.get(task_id).await,
                };
            }
            TaskReport::Running => {
                self.apply_report(task_id, worker_id, |task| {
                    if task.state != TaskState::Assigned {
                        // Repeated ack.
                        return Ok(false);
                    }
                    task.start(now)?;
                    Ok(true)
                })
                .await?
            }
            TaskReport::Completed { result } => {
                self.apply_report(task_id, worker_id, |task| {
                    task.complete(result.clone(), now)?;
                    Ok(true)
                })
                .await?
            }
        };

        if update.task.is_terminal() && !update.changed {
            return self.accept_late_report(update.task, worker_id, &report).await;
        }

        if update.changed {
            info!(
                task_id = %task_id,
                worker_id = %worker_id,
                from = %update.from,
                to = %update.task.state,
                "Task updated by worker"
            );
            self.publish(&update, Some(worker_id.clone()));
        }

        if update.task.is_terminal() {
            self.registry.release(worker_id, task_id).await?;
        }

        Ok(update.task)
    }

    /// Transition a task on behalf of the worker holding it. Terminal tasks
    /// are returned unchanged.
    async fn apply_report<F>(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        mut apply: F,
    ) -> CoreResult<TaskUpdate>
    where
        F: FnMut(&mut Task) -> CoreResult<bool> + Send,
    {
        modify_task(self.tasks.as_ref(), task_id, |task| {
            if task.is_terminal() {
                return Ok(false);
            }
            if task.assigned_worker.as_ref() != Some(worker_id) {
                return Err(not_held(task, worker_id));
            }
            apply(task)
        })
        .await
    }

    async fn accept_late_report(
        &self,
        task: Task,
        worker_id: &WorkerId,
        report: &TaskReport,
    ) -> CoreResult<Task> {
        info!(
            task_id = %task.id,
            worker_id = %worker_id,
            state = %task.state,
            report = ?report,
            "Report raced a terminal transition, state unchanged"
        );
        if report.is_terminal() {
            if let Err(e) = self.registry.release(worker_id, &task.id).await {
                debug!(worker_id = %worker_id, task_id = %task.id, error = %e, "Worker not released");
            }
        }
        Ok(task)
    }

    /// Cancel a non-terminal task. A worker still executing it is told to stop
    /// on its next heartbeat.
    pub async fn cancel_task(&self, task_id: &TaskId) -> CoreResult<Task> {
        let now = Utc::now();
        let mut holder = None;
        let update = modify_task(self.tasks.as_ref(), task_id, |task| {
            holder = task.assigned_worker.clone();
            task.cancel(now)?;
            Ok(true)
        })
        .await?;

        info!(task_id = %task_id, from = %update.from, worker_id = ?holder, "Task cancelled");
        self.publish(&update, holder);
        Ok(update.task)
    }

    /// `running -> paused`. The worker keeps the assignment.
    pub async fn pause_task(&self, task_id: &TaskId) -> CoreResult<Task> {
        let update = modify_task(self.tasks.as_ref(), task_id, |task| {
            task.pause()?;
            Ok(true)
        })
        .await?;

        info!(task_id = %task_id, "Task paused");
        self.publish(&update, update.task.assigned_worker.clone());
        Ok(update.task)
    }

    /// `paused -> running`.
    pub async fn resume_task(&self, task_id: &TaskId) -> CoreResult<Task> {
        let update = modify_task(self.tasks.as_ref(), task_id, |task| {
            task.resume()?;
            Ok(true)
        })
        .await?;

        info!(task_id = %task_id, "Task resumed");
        self.publish(&update, update.task.assigned_worker.clone());
        Ok(update.task)
    }

    /// Operator override: hand a pending task to a specific worker.
    pub async fn assign_task(&self, task_id: &TaskId, worker_id: &WorkerId) -> CoreResult<Task> {
        self.dispatcher.assign(task_id, worker_id).await
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Persist a checkpoint for a live task.
    ///
    /// When `worker_id` is given it must be the worker holding the task.
    pub async fn create_checkpoint(
        &self,
        task_id: &TaskId,
        worker_id: Option<&WorkerId>,
        name: Option<String>,
        data: Value,
    ) -> CoreResult<Checkpoint> {
        let task = self.tasks.get(task_id).await?;
        if task.is_terminal() {
            return Err(CoreError::Conflict {
                kind: "task",
                id: task.id.to_string(),
                reason: format!("cannot checkpoint a {} task", task.state),
            });
        }
        if let Some(worker_id) = worker_id {
            if task.assigned_worker.as_ref() != Some(worker_id) {
                return Err(not_held(&task, worker_id));
            }
        }

        let checkpoint = self.checkpoints.append(task_id, name, data).await?;
        debug!(
            task_id = %task_id,
            sequence = checkpoint.sequence,
            name = ?checkpoint.name,
            "Checkpoint stored"
        );
        Ok(checkpoint)
    }

    /// Checkpoint history in sequence order.
    pub async fn get_checkpoints(&self, task_id: &TaskId) -> CoreResult<Vec<Checkpoint>> {
        self.tasks.get(task_id).await?;
        self.checkpoints.list(task_id).await
    }

    /// Resume point: the highest-sequence checkpoint.
    pub async fn latest_checkpoint(&self, task_id: &TaskId) -> CoreResult<Checkpoint> {
        self.tasks.get(task_id).await?;
        self.checkpoints.latest(task_id).await
    }

    /// Remove one checkpoint. Its sequence number is not handed out again.
    pub async fn delete_checkpoint(&self, task_id: &TaskId, sequence: u64) -> CoreResult<()> {
        self.tasks.get(task_id).await?;
        self.checkpoints.delete(task_id, sequence).await?;
        info!(task_id = %task_id, sequence, "Checkpoint deleted");
        Ok(())
    }

    /// Remove a task's whole checkpoint history, returning how many went.
    pub async fn delete_all_checkpoints(&self, task_id: &TaskId) -> CoreResult<usize> {
        self.tasks.get(task_id).await?;
        let deleted = self.checkpoints.delete_all(task_id).await?;
        info!(task_id = %task_id, deleted, "Checkpoints deleted");
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub async fn register_worker(&self, registration: WorkerRegistration) -> CoreResult<Worker> {
        self.registry.register(registration, Utc::now()).await
    }

    /// Record a heartbeat and tell the worker what to do next.
    pub async fn heartbeat(&self, worker_id: &WorkerId, status: WorkerStatus) -> CoreResult<HeartbeatReply> {
        let now = Utc::now();
        let mut worker = self.registry.heartbeat(worker_id, status, now).await?;

        let Some(task_id) = worker.current_task.clone() else {
            return Ok(HeartbeatReply {
                worker,
                directive: Directive::Continue,
                assignment: None,
            });
        };

        let task = match self.tasks.get(&task_id).await {
            Ok(task) => Some(task),
            Err(CoreError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let held = task
            .as_ref()
            .filter(|t| !t.is_terminal() && t.assigned_worker.as_ref() == Some(worker_id));

        let Some(task) = held else {
            if status == WorkerStatus::Online || task.is_none() {
                // The worker has let go of a task that is no longer its own.
                worker = self.registry.release(worker_id, &task_id).await?;
                debug!(worker_id = %worker_id, task_id = %task_id, "Released worker from stale task");
                return Ok(HeartbeatReply {
                    worker,
                    directive: Directive::Continue,
                    assignment: None,
                });
            }
            return Ok(HeartbeatReply {
                worker,
                directive: Directive::Stop,
                assignment: None,
            });
        };

        let directive = match task.state {
            TaskState::Paused => Directive::Pause,
            _ => Directive::Continue,
        };

        let assignment = if task.state == TaskState::Assigned {
            let resume_from = match self.checkpoints.latest(&task_id).await {
                Ok(checkpoint) => Some(checkpoint),
                Err(CoreError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            Some(WorkAssignment {
                task: task.clone(),
                resume_from,
            })
        } else {
            self.touch_task(&task_id, worker_id, now).await;
            None
        };

        Ok(HeartbeatReply {
            worker,
            directive,
            assignment,
        })
    }

    /// Refresh `last_heartbeat_at` on a task the worker is executing.
    async fn touch_task(&self, task_id: &TaskId, worker_id: &WorkerId, now: chrono::DateTime<Utc>) {
        let result = modify_task(self.tasks.as_ref(), task_id, |task| {
            if task.assigned_worker.as_ref() != Some(worker_id) {
                return Ok(false);
            }
            task.last_heartbeat_at = Some(now);
            Ok(true)
        })
        .await;

        if let Err(e) = result {
            debug!(task_id = %task_id, error = %e, "Task heartbeat not recorded");
        }
    }

    pub async fn deregister_worker(&self, worker_id: &WorkerId) -> CoreResult<Worker> {
        self.registry.deregister(worker_id).await
    }

    pub async fn drain_worker(&self, worker_id: &WorkerId) -> CoreResult<Worker> {
        self.registry.drain(worker_id).await
    }

    pub async fn get_worker(&self, worker_id: &WorkerId) -> CoreResult<Worker> {
        self.registry.get(worker_id).await
    }

    pub async fn list_workers(&self) -> CoreResult<Vec<Worker>> {
        self.registry.list().await
    }

    pub async fn worker_stats(&self) -> CoreResult<WorkerStats> {
        self.registry.stats().await
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
