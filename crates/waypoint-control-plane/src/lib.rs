//! Waypoint Control Plane Library
//!
//! Accepts tasks, pairs them with remote workers, tracks worker liveness and
//! stores checkpoints so interrupted work can resume. The HTTP API in
//! [`http`] is a thin layer over [`manager::TaskManager`].

pub mod backoff;
pub mod config;
pub mod dependencies;
pub mod dispatcher;
pub mod events;
pub mod health;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod store;

pub use config::Config;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use events::EventBus;
pub use health::{HealthMonitor, SweepReport};
pub use manager::{Directive, HeartbeatReply, NewTask, TaskManager, TaskProgress, TaskReport};
pub use registry::WorkerRegistry;
pub use state::AppState;
