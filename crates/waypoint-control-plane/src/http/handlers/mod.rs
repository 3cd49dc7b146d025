//! HTTP request handlers.

mod events;
mod health;
mod tasks;
mod workers;

pub use events::stream_events;
pub use health::{health_check, metrics_handler};
pub use tasks::{
    assign_task, blocking_dependencies, cancel_task, create_checkpoint, create_task,
    delete_all_checkpoints, delete_checkpoint, get_task, latest_checkpoint, list_checkpoints,
    list_tasks, pause_task, report_task, resume_task, task_progress,
};
pub use workers::{
    deregister_worker, drain_worker, get_worker, heartbeat, list_workers, register_worker,
    worker_stats,
};
