//! Waypoint Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Storage engines
//! - Runtime specifics
//!
//! Tasks, workers and checkpoints, the lifecycle state machine that governs
//! them, and the error taxonomy shared by every layer above.

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use checkpoint::Checkpoint;
pub use error::{CoreError, CoreResult};
pub use event::LifecycleEvent;
pub use filter::TaskFilters;
pub use ids::{TaskId, WorkerId};
pub use status::{TaskState, WorkerStatus};
pub use task::{Task, TaskType};
pub use worker::{Worker, WorkerRegistration};
