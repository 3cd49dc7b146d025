//! Worker records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TaskId, TaskType, WorkerId, WorkerStatus};

/// What a worker announces when it registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Hostname of the worker machine (display only).
    #[serde(default)]
    pub hostname: String,

    /// Task types the worker can execute.
    pub capabilities: Vec<String>,
}

impl WorkerRegistration {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            capabilities: Vec::new(),
        }
    }

    /// Builder method to add a capability tag.
    pub fn with_capability(mut self, tag: impl AsRef<str>) -> Self {
        self.capabilities.push(tag.as_ref().to_string());
        self
    }
}

/// A remote executor known to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique worker identifier.
    pub id: WorkerId,

    /// Hostname of the worker machine.
    pub hostname: String,

    /// Task type tags this worker can run (normalized like `TaskType`).
    pub capabilities: BTreeSet<String>,

    /// Current availability.
    pub status: WorkerStatus,

    /// Last liveness signal.
    pub last_heartbeat_at: DateTime<Utc>,

    /// Task the worker is executing, if any. At most one.
    pub current_task: Option<TaskId>,

    pub registered_at: DateTime<Utc>,

    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: u64,
}

impl Worker {
    /// Build an online worker from a registration.
    pub fn from_registration(registration: WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkerId::generate(),
            hostname: registration.hostname,
            capabilities: registration
                .capabilities
                .iter()
                .map(|tag| TaskType::new(tag).as_str().to_string())
                .filter(|tag| !tag.is_empty())
                .collect(),
            status: WorkerStatus::Online,
            last_heartbeat_at: now,
            current_task: None,
            registered_at: now,
            version: 0,
        }
    }

    /// Check if this worker can run tasks of the given type.
    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.capabilities.contains(task_type.as_str())
    }

    /// Whether the dispatcher may pair this worker with `task_type` now.
    pub fn is_eligible_for(&self, task_type: &TaskType) -> bool {
        self.status.accepts_assignments() && self.current_task.is_none() && self.supports(task_type)
    }

    /// Whether the heartbeat is older than `timeout` at `now`.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat_at) > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_normalizes_capabilities() {
        let reg = WorkerRegistration::new("host-a")
            .with_capability("Build")
            .with_capability("test")
            .with_capability("  ");
        let worker = Worker::from_registration(reg, Utc::now());

        assert_eq!(worker.status, WorkerStatus::Online);
        assert!(worker.supports(&TaskType::new("build")));
        assert!(worker.supports(&TaskType::new("TEST")));
        assert_eq!(worker.capabilities.len(), 2);
    }

    #[test]
    fn test_eligibility_requires_online_and_idle() {
        let reg = WorkerRegistration::new("host-a").with_capability("build");
        let mut worker = Worker::from_registration(reg, Utc::now());
        let build = TaskType::new("build");

        assert!(worker.is_eligible_for(&build));
        assert!(!worker.is_eligible_for(&TaskType::new("deploy")));

        worker.status = WorkerStatus::Draining;
        assert!(!worker.is_eligible_for(&build));
    }

    #[test]
    fn test_heartbeat_expired() {
        let now = Utc::now();
        let worker = Worker::from_registration(WorkerRegistration::new("h"), now);
        let timeout = chrono::Duration::seconds(30);

        assert!(!worker.heartbeat_expired(now + chrono::Duration::seconds(30), timeout));
        assert!(worker.heartbeat_expired(now + chrono::Duration::seconds(31), timeout));
    }
}
