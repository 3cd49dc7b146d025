//! Control plane configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub http_bind_addr: String,

    /// Heartbeat timeout before considering a worker dead (seconds).
    pub heartbeat_timeout_secs: u64,

    /// Interval between health sweeps (seconds).
    pub sweep_interval_secs: u64,

    /// Interval between dispatch cycles (milliseconds).
    pub dispatch_interval_ms: u64,

    /// Time a worker has to acknowledge an assignment (seconds).
    pub ack_timeout_secs: u64,

    /// Default attempt budget for new tasks.
    pub max_attempts: u32,

    /// First redispatch delay (milliseconds).
    pub backoff_base_ms: u64,

    /// Upper bound on the redispatch delay (milliseconds).
    pub backoff_max_ms: u64,

    /// Randomize redispatch delays by ±25%.
    pub backoff_jitter: bool,

    /// Capacity of the lifecycle event channel.
    pub event_channel_capacity: usize,

    /// Seconds an offline worker's record is kept after its last heartbeat.
    pub offline_retention_secs: u64,

    /// Root for durable tasks (`tasks/`) and checkpoints (`checkpoints/`);
    /// in-memory when unset.
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn ack_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ack_timeout_secs as i64)
    }

    pub fn offline_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_retention_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(10))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind_addr: "[::1]:50052".to_string(),
            heartbeat_timeout_secs: 45,
            sweep_interval_secs: 5,
            dispatch_interval_ms: 500,
            ack_timeout_secs: 30,
            max_attempts: waypoint_core::task::DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_jitter: true,
            event_channel_capacity: 1024,
            offline_retention_secs: 600,
            data_dir: None,
        }
    }
}
