//! Shared application state.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use waypoint_core::CoreResult;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::manager::TaskManager;
use crate::registry::WorkerRegistry;
use crate::store::{
    CheckpointStore, FileCheckpointStore, FileTaskStore, InMemoryCheckpointStore,
    InMemoryTaskStore, InMemoryWorkerStore, TaskStore, WorkerStore,
};

/// Everything the HTTP layer and the background loops share.
pub struct AppState {
    pub config: Config,

    /// Façade for all task, checkpoint and worker operations.
    pub manager: Arc<TaskManager>,

    pub dispatcher: Arc<Dispatcher>,

    pub health: Arc<HealthMonitor>,

    pub registry: Arc<WorkerRegistry>,

    /// Task store, read directly by the metrics endpoint.
    pub tasks: Arc<dyn TaskStore>,

    pub events: EventBus,

    /// Cancelled once at shutdown; stops the background loops.
    shutdown: CancellationToken,
}

impl AppState {
    /// Create an AppState with in-memory stores, wrapped in Arc.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_stores(
            config,
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryWorkerStore::new()),
        )
    }

    /// Create an AppState, using durable task and checkpoint stores when
    /// `config.data_dir` is set. Workers are always in memory and must
    /// re-register after a restart.
    pub async fn from_config(config: Config) -> CoreResult<Arc<Self>> {
        let (tasks, checkpoints): (Arc<dyn TaskStore>, Arc<dyn CheckpointStore>) =
            match &config.data_dir {
                Some(dir) => {
                    let tasks = FileTaskStore::open(dir.join("tasks")).await?;
                    let checkpoints = FileCheckpointStore::open(dir.join("checkpoints")).await?;
                    info!(path = %dir.display(), "Using file-backed task and checkpoint stores");
                    (Arc::new(tasks), Arc::new(checkpoints))
                }
                None => (
                    Arc::new(InMemoryTaskStore::new()),
                    Arc::new(InMemoryCheckpointStore::new()),
                ),
            };

        Ok(Self::with_stores(
            config,
            tasks,
            checkpoints,
            Arc::new(InMemoryWorkerStore::new()),
        ))
    }

    /// Wire the components over the given stores.
    pub fn with_stores(
        config: Config,
        tasks: Arc<dyn TaskStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        workers: Arc<dyn WorkerStore>,
    ) -> Arc<Self> {
        let events = EventBus::new(config.event_channel_capacity);
        let registry = Arc::new(WorkerRegistry::new(workers));
        let dispatcher = Arc::new(Dispatcher::new(
            tasks.clone(),
            registry.clone(),
            events.clone(),
            &config,
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            dispatcher.clone(),
            config.heartbeat_timeout(),
            config.offline_retention(),
            config.sweep_interval(),
        ));
        let manager = Arc::new(TaskManager::new(
            tasks.clone(),
            checkpoints,
            registry.clone(),
            dispatcher.clone(),
            events.clone(),
            config.max_attempts,
        ));

        Arc::new(Self {
            config,
            manager,
            dispatcher,
            health,
            registry,
            tasks,
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the dispatch and health loops.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.dispatcher.clone().run(self.shutdown.clone())),
            tokio::spawn(self.health.clone().run(self.shutdown.clone())),
        ]
    }

    /// Signal the background loops to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::NewTask;
    use serde_json::json;
    use waypoint_core::TaskState;

    #[tokio::test]
    async fn test_background_loops_stop_on_shutdown() {
        let state = AppState::new(Config::default());
        let handles = state.spawn_background();

        state.shutdown();
        assert!(state.is_shutting_down());
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_tasks_and_checkpoints_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };

        let task_id = {
            let state = AppState::from_config(config.clone()).await.unwrap();
            let task = state
                .manager
                .create_task(NewTask {
                    task_type: "build".into(),
                    owner: "alice".into(),
                    payload: json!({"repo": "waypoint"}),
                    max_attempts: None,
                    dependencies: Vec::new(),
                })
                .await
                .unwrap();
            for step in 1..=2 {
                state
                    .manager
                    .create_checkpoint(&task.id, None, None, json!({"step": step}))
                    .await
                    .unwrap();
            }
            task.id
        };
        assert!(dir.path().join("tasks").is_dir());
        assert!(dir.path().join("checkpoints").is_dir());

        let state = AppState::from_config(config).await.unwrap();
        let task = state.manager.get_task(&task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let latest = state.manager.latest_checkpoint(&task_id).await.unwrap();
        assert_eq!(latest.data, json!({"step": 2}));
        assert_eq!(state.manager.get_checkpoints(&task_id).await.unwrap().len(), 2);

        let next = state
            .manager
            .create_checkpoint(&task_id, None, None, json!({"step": 3}))
            .await
            .unwrap();
        assert_eq!(next.sequence, 3);
    }
}
