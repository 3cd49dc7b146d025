//! End-to-end lifecycle scenarios against the in-process control plane.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::Mutex;

use waypoint_control_plane::store::{
    InMemoryCheckpointStore, InMemoryTaskStore, InMemoryWorkerStore, WorkerStore,
};
use waypoint_control_plane::{AppState, Config, Directive, NewTask, TaskReport};
use waypoint_core::{
    CoreResult, Task, TaskFilters, TaskId, TaskState, Worker, WorkerId, WorkerRegistration,
    WorkerStatus,
};

fn state() -> Arc<AppState> {
    AppState::new(Config {
        backoff_jitter: false,
        ..Config::default()
    })
}

fn build_task() -> NewTask {
    NewTask {
        task_type: "build".into(),
        owner: "alice".into(),
        payload: json!({"repo": "waypoint", "ref": "main"}),
        max_attempts: None,
        dependencies: Vec::new(),
    }
}

async fn register(state: &AppState, capability: &str) -> WorkerId {
    state
        .manager
        .register_worker(WorkerRegistration::new("host").with_capability(capability))
        .await
        .unwrap()
        .id
}

fn assert_invariants(task: &Task) {
    if let Err(violation) = task.check_invariants() {
        panic!("{violation}");
    }
}

#[tokio::test]
async fn test_task_survives_worker_loss_and_completes_elsewhere() {
    let state = state();
    let config = &state.config;

    // No workers yet, the task waits.
    let t1 = state.manager.create_task(build_task()).await.unwrap();
    let pending = state
        .manager
        .list_tasks(&TaskFilters::new().with_state(TaskState::Pending))
        .await
        .unwrap();
    assert_eq!(pending.tasks.iter().map(|t| &t.id).collect::<Vec<_>>(), vec![&t1.id]);

    let w1 = register(&state, "build").await;
    let report = state.dispatcher.dispatch_cycle_at(Utc::now()).await.unwrap();
    assert_eq!(report.assigned.len(), 1);

    let task = state.manager.get_task(&t1.id).await.unwrap();
    assert_eq!(task.state, TaskState::Assigned);
    assert_eq!(task.assigned_worker, Some(w1.clone()));
    assert_invariants(&task);
    assert_eq!(state.manager.get_worker(&w1).await.unwrap().status, WorkerStatus::Busy);

    // W1 goes silent past the heartbeat timeout.
    let swept_at = Utc::now() + config.heartbeat_timeout() + Duration::seconds(1);
    let sweep = state.health.sweep_at(swept_at).await.unwrap();
    assert_eq!(sweep.offline, vec![w1.clone()]);

    assert_eq!(state.manager.get_worker(&w1).await.unwrap().status, WorkerStatus::Offline);
    let task = state.manager.get_task(&t1.id).await.unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempt, 1);
    assert_invariants(&task);

    // Redispatched to W2, which checkpoints three times and completes.
    let w2 = register(&state, "build").await;
    let after_backoff = swept_at + Duration::milliseconds(config.backoff_base_ms as i64 + 1);
    let report = state.dispatcher.dispatch_cycle_at(after_backoff).await.unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].worker_id, w2);

    let reply = state.manager.heartbeat(&w2, WorkerStatus::Online).await.unwrap();
    assert_eq!(reply.assignment.unwrap().task.id, t1.id);

    state.manager.update_task(&t1.id, &w2, TaskReport::Running).await.unwrap();
    for step in 1..=3 {
        state
            .manager
            .create_checkpoint(&t1.id, Some(&w2), Some(format!("step-{step}")), json!({"step": step}))
            .await
            .unwrap();
    }
    let done = state
        .manager
        .update_task(&t1.id, &w2, TaskReport::Completed { result: Some(json!({"artifact": "a.tar"})) })
        .await
        .unwrap();

    assert_eq!(done.state, TaskState::Completed);
    assert!(done.assigned_worker.is_none());
    assert_invariants(&done);

    let checkpoints = state.manager.get_checkpoints(&t1.id).await.unwrap();
    let steps: Vec<_> = checkpoints.iter().map(|c| c.data["step"].clone()).collect();
    assert_eq!(steps, vec![json!(1), json!(2), json!(3)]);
    assert!(checkpoints.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let w2_now = state.manager.get_worker(&w2).await.unwrap();
    assert_eq!(w2_now.status, WorkerStatus::Online);
    assert!(w2_now.current_task.is_none());
}

#[tokio::test]
async fn test_late_completion_after_cancel_keeps_cancelled() {
    let state = state();
    let task = state.manager.create_task(build_task()).await.unwrap();
    let worker = register(&state, "build").await;

    state.dispatcher.dispatch_cycle_at(Utc::now()).await.unwrap();
    state.manager.update_task(&task.id, &worker, TaskReport::Running).await.unwrap();

    let cancelled = state.manager.cancel_task(&task.id).await.unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);
    assert_invariants(&cancelled);

    let reply = state.manager.heartbeat(&worker, WorkerStatus::Busy).await.unwrap();
    assert_eq!(reply.directive, Directive::Stop);

    // The worker finished before it saw the stop.
    let after = state
        .manager
        .update_task(&task.id, &worker, TaskReport::Completed { result: None })
        .await
        .unwrap();
    assert_eq!(after.state, TaskState::Cancelled);
    assert_eq!(state.manager.get_task(&task.id).await.unwrap().state, TaskState::Cancelled);

    let worker = state.manager.get_worker(&worker).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
    assert!(worker.current_task.is_none());
}

#[tokio::test]
async fn test_round_trip_three_checkpoints() {
    let state = state();
    let task = state.manager.create_task(build_task()).await.unwrap();
    let worker = register(&state, "build").await;
    state.manager.assign_task(&task.id, &worker).await.unwrap();
    state.manager.update_task(&task.id, &worker, TaskReport::Running).await.unwrap();

    for i in 0..3 {
        state
            .manager
            .create_checkpoint(&task.id, Some(&worker), None, json!({"i": i}))
            .await
            .unwrap();
    }
    state
        .manager
        .update_task(&task.id, &worker, TaskReport::Completed { result: None })
        .await
        .unwrap();

    let history = state.manager.get_checkpoints(&task.id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.iter().map(|c| c.data["i"].as_i64().unwrap()).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let task = state.manager.get_task(&task.id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert!(task.assigned_worker.is_none());
}

#[tokio::test]
async fn test_attempts_are_monotonic_and_bounded() {
    let state = state();
    let task = state.manager.create_task(build_task()).await.unwrap();
    let worker = register(&state, "build").await;

    let mut last_attempt = 0;
    let mut now = Utc::now();
    loop {
        now += Duration::minutes(5);
        let report = state.dispatcher.dispatch_cycle_at(now).await.unwrap();
        if report.assigned.is_empty() {
            break;
        }
        state.manager.update_task(&task.id, &worker, TaskReport::Running).await.unwrap();
        let after = state
            .manager
            .update_task(&task.id, &worker, TaskReport::Failed { error: "exit 1".into() })
            .await
            .unwrap();

        assert!(after.attempt > last_attempt);
        assert!(after.attempt <= after.max_attempts + 1);
        assert_invariants(&after);
        last_attempt = after.attempt;
    }

    let task = state.manager.get_task(&task.id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempt, task.max_attempts);
    assert!(task.error_message.unwrap().contains("exit 1"));
}

#[tokio::test]
async fn test_worker_holds_at_most_one_task() {
    let state = state();
    for _ in 0..10 {
        state.manager.create_task(build_task()).await.unwrap();
    }
    let mut workers = Vec::new();
    for _ in 0..3 {
        workers.push(register(&state, "build").await);
    }

    // Concurrent dispatch cycles race for the same workers.
    let now = Utc::now();
    let cycles: Vec<_> = (0..4)
        .map(|_| {
            let state = state.clone();
            tokio::spawn(async move { state.dispatcher.dispatch_cycle_at(now).await })
        })
        .collect();
    for cycle in cycles {
        cycle.await.unwrap().unwrap();
    }
    // Rolled-back pairings can leave a worker idle until the next cycle.
    state.dispatcher.dispatch_cycle_at(now).await.unwrap();

    let held = state
        .manager
        .list_tasks(&TaskFilters::new().with_state(TaskState::Assigned))
        .await
        .unwrap()
        .tasks;
    assert_eq!(held.len(), 3);

    let mut per_worker: HashMap<WorkerId, usize> = HashMap::new();
    for task in &held {
        assert_invariants(task);
        *per_worker.entry(task.assigned_worker.clone().unwrap()).or_default() += 1;
    }
    assert!(per_worker.values().all(|n| *n == 1));

    for id in &workers {
        let worker = state.manager.get_worker(id).await.unwrap();
        let task_id = worker.current_task.expect("every worker is busy");
        let task = state.manager.get_task(&task_id).await.unwrap();
        assert_eq!(task.assigned_worker.as_ref(), Some(id));
    }
}

#[tokio::test]
async fn test_concurrent_checkpoints_never_reuse_sequences() {
    let state = state();
    let task = state.manager.create_task(build_task()).await.unwrap();

    let appends: Vec<_> = (0..20)
        .map(|i| {
            let state = state.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                state.manager.create_checkpoint(&id, None, None, json!(i)).await
            })
        })
        .collect();
    for append in appends {
        append.await.unwrap().unwrap();
    }

    let sequences: Vec<u64> = state
        .manager
        .get_checkpoints(&task.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.sequence)
        .collect();
    assert_eq!(sequences.len(), 20);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_repeated_heartbeat_is_idempotent() {
    let state = state();
    let task = state.manager.create_task(build_task()).await.unwrap();
    let worker = register(&state, "build").await;
    state.dispatcher.dispatch_cycle_at(Utc::now()).await.unwrap();
    state.manager.update_task(&task.id, &worker, TaskReport::Running).await.unwrap();

    let first = state.manager.heartbeat(&worker, WorkerStatus::Busy).await.unwrap();
    let second = state.manager.heartbeat(&worker, WorkerStatus::Busy).await.unwrap();

    assert_eq!(first.worker.current_task, Some(task.id.clone()));
    assert_eq!(second.worker.current_task, Some(task.id.clone()));
    assert_eq!(first.directive, second.directive);

    let task = state.manager.get_task(&task.id).await.unwrap();
    assert_eq!(task.attempt, 0);
    assert_eq!(task.state, TaskState::Running);
    assert_eq!(task.assigned_worker, Some(worker));
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let state = state();
    let mut events = state.events.subscribe();

    let task = state.manager.create_task(build_task()).await.unwrap();
    let worker = register(&state, "build").await;
    state.dispatcher.dispatch_cycle_at(Utc::now()).await.unwrap();
    state.manager.update_task(&task.id, &worker, TaskReport::Running).await.unwrap();
    state
        .manager
        .update_task(&task.id, &worker, TaskReport::Completed { result: None })
        .await
        .unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.task_id, task.id);
        transitions.push(event.to);
    }
    assert_eq!(
        transitions,
        vec![TaskState::Assigned, TaskState::Running, TaskState::Completed]
    );
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let state = state();
    let err = state.manager.get_task(&TaskId::new("nope")).await.unwrap_err();
    assert!(matches!(err, waypoint_core::CoreError::NotFound { .. }));
}

/// Worker store that runs a one-shot hook before the next update lands.
#[derive(Default)]
struct HookedWorkers {
    inner: InMemoryWorkerStore,
    hook: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl HookedWorkers {
    async fn arm(&self, hook: BoxFuture<'static, ()>) {
        *self.hook.lock().await = Some(hook);
    }
}

#[async_trait]
impl WorkerStore for HookedWorkers {
    async fn insert(&self, worker: Worker) -> CoreResult<Worker> {
        self.inner.insert(worker).await
    }

    async fn get(&self, id: &WorkerId) -> CoreResult<Worker> {
        self.inner.get(id).await
    }

    async fn update(&self, worker: Worker) -> CoreResult<Worker> {
        let hook = self.hook.lock().await.take();
        if let Some(hook) = hook {
            hook.await;
        }
        self.inner.update(worker).await
    }

    async fn remove(&self, id: &WorkerId, version: u64) -> CoreResult<Worker> {
        self.inner.remove(id, version).await
    }

    async fn list(&self) -> CoreResult<Vec<Worker>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_cancel_while_worker_is_claimed_leaves_worker_idle() {
    let workers = Arc::new(HookedWorkers::default());
    let state = AppState::with_stores(
        Config::default(),
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(InMemoryCheckpointStore::new()),
        workers.clone(),
    );
    let mut events = state.events.subscribe();

    let task = state.manager.create_task(build_task()).await.unwrap();
    let worker = register(&state, "build").await;

    // The cancel lands between the task write and the worker claim.
    let racer = state.clone();
    let task_id = task.id.clone();
    workers
        .arm(Box::pin(async move {
            racer.manager.cancel_task(&task_id).await.unwrap();
        }))
        .await;

    let report = state.dispatcher.dispatch_cycle_at(Utc::now()).await.unwrap();
    assert!(report.assigned.is_empty());
    assert_eq!(report.skipped, 1);

    let task = state.manager.get_task(&task.id).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert_invariants(&task);

    let worker = state.manager.get_worker(&worker).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Online);
    assert!(worker.current_task.is_none());

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        transitions.push((event.from, event.to));
    }
    assert_eq!(
        transitions,
        vec![
            (TaskState::Pending, TaskState::Assigned),
            (TaskState::Assigned, TaskState::Cancelled),
        ]
    );
}

#[tokio::test]
async fn test_dependent_runs_after_dependency_or_is_abandoned() {
    let state = state();
    let worker = register(&state, "build").await;

    let first = state.manager.create_task(build_task()).await.unwrap();
    let second = state
        .manager
        .create_task(NewTask {
            dependencies: vec![first.id.clone()],
            ..build_task()
        })
        .await
        .unwrap();
    let doomed = state
        .manager
        .create_task(NewTask {
            dependencies: vec![second.id.clone()],
            ..build_task()
        })
        .await
        .unwrap();

    let now = Utc::now();
    let report = state.dispatcher.dispatch_cycle_at(now).await.unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].task_id, first.id);
    assert_eq!(report.blocked, 2);

    state.manager.update_task(&first.id, &worker, TaskReport::Running).await.unwrap();
    state
        .manager
        .update_task(&first.id, &worker, TaskReport::Completed { result: None })
        .await
        .unwrap();

    let report = state.dispatcher.dispatch_cycle_at(now).await.unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].task_id, second.id);

    state.manager.cancel_task(&second.id).await.unwrap();
    let report = state.dispatcher.dispatch_cycle_at(now).await.unwrap();
    assert_eq!(report.abandoned, vec![doomed.id.clone()]);

    let doomed = state.manager.get_task(&doomed.id).await.unwrap();
    assert_eq!(doomed.state, TaskState::Cancelled);
    assert_invariants(&doomed);
}
