//! Health monitor - detects silent workers and reclaims their tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use waypoint_core::{CoreResult, WorkerId, WorkerStatus};

use crate::dispatcher::Dispatcher;
use crate::registry::WorkerRegistry;

/// What one health sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Workers marked offline this sweep.
    pub offline: Vec<WorkerId>,
    /// Tasks handed back to the dispatcher's failure path.
    pub reclaimed: usize,
    /// Offline workers forgotten after the retention window.
    pub evicted: Vec<WorkerId>,
}

pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    heartbeat_timeout: chrono::Duration,
    offline_retention: chrono::Duration,
    interval: std::time::Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<Dispatcher>,
        heartbeat_timeout: chrono::Duration,
        offline_retention: chrono::Duration,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            heartbeat_timeout,
            offline_retention,
            interval,
        }
    }

    /// Mark every worker whose heartbeat expired at `now` offline and fail
    /// the attempt of any task it was holding, then evict offline workers
    /// past the retention window.
    ///
    /// Per-worker errors are logged and left for the next sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> CoreResult<SweepReport> {
        let mut report = SweepReport::default();

        for worker in self.registry.expired(now, self.heartbeat_timeout).await? {
            let (worker, orphaned) = match self
                .registry
                .mark_offline_if_expired(&worker.id, now, self.heartbeat_timeout)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "Failed to mark worker offline");
                    continue;
                }
            };

            if worker.status != WorkerStatus::Offline {
                // Heartbeat arrived between the scan and the update.
                continue;
            }

            info!(
                worker_id = %worker.id,
                last_heartbeat = %worker.last_heartbeat_at,
                "Worker marked offline"
            );
            report.offline.push(worker.id.clone());

            let Some(task_id) = orphaned else {
                continue;
            };
            let reason = format!("worker {} stopped heartbeating", worker.id);
            match self
                .dispatcher
                .handle_attempt_failed(&task_id, &worker.id, &reason, now)
                .await
            {
                Ok(Some(_)) => report.reclaimed += 1,
                Ok(None) => {}
                Err(e) => warn!(
                    task_id = %task_id,
                    worker_id = %worker.id,
                    error = %e,
                    "Failed to reclaim task from offline worker"
                ),
            }
        }

        report.reclaimed += self.dispatcher.reclaim_orphans_at(now).await?.len();

        // Orphans are reclaimed first so an evicted worker holds nothing.
        report.evicted = self.registry.evict_offline(now, self.offline_retention).await?;

        Ok(report)
    }

    /// Sweep loop. Runs until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.heartbeat_timeout.num_seconds(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        warn!(error = %e, "Health sweep failed");
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }
}
