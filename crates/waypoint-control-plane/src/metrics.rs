//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use waypoint_core::{CoreResult, TaskFilters, TaskState, WorkerStatus};

use crate::state::AppState;
use crate::store::list_all;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> CoreResult<String> {
    let mut output = String::new();

    collect_worker_metrics(state, &mut output).await?;
    collect_task_metrics(state, &mut output).await?;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP waypoint_event_subscribers Number of lifecycle event subscribers"
    )
    .ok();
    writeln!(output, "# TYPE waypoint_event_subscribers gauge").ok();
    writeln!(
        output,
        "waypoint_event_subscribers {}",
        state.events.subscriber_count()
    )
    .ok();

    Ok(output)
}

/// Collect worker metrics by status.
async fn collect_worker_metrics(state: &Arc<AppState>, output: &mut String) -> CoreResult<()> {
    let stats = state.registry.stats().await?;

    writeln!(
        output,
        "# HELP waypoint_workers Number of registered workers by status"
    )
    .ok();
    writeln!(output, "# TYPE waypoint_workers gauge").ok();
    for status in WorkerStatus::ALL {
        let count = match status {
            WorkerStatus::Online => stats.online,
            WorkerStatus::Busy => stats.busy,
            WorkerStatus::Draining => stats.draining,
            WorkerStatus::Offline => stats.offline,
        };
        writeln!(output, "waypoint_workers{{status=\"{status}\"}} {count}").ok();
    }

    Ok(())
}

/// Collect task metrics by state.
async fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) -> CoreResult<()> {
    let tasks = list_all(state.tasks.as_ref(), TaskFilters::new()).await?;

    let mut counts = [0u64; TaskState::ALL.len()];
    let mut attempts = 0u64;
    for task in &tasks {
        if let Some(i) = TaskState::ALL.iter().position(|s| *s == task.state) {
            counts[i] += 1;
        }
        attempts += u64::from(task.attempt);
    }

    writeln!(output).ok();
    writeln!(output, "# HELP waypoint_tasks Number of tasks by state").ok();
    writeln!(output, "# TYPE waypoint_tasks gauge").ok();
    for (state, count) in TaskState::ALL.iter().zip(counts) {
        writeln!(output, "waypoint_tasks{{state=\"{state}\"}} {count}").ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP waypoint_task_failed_attempts Failed dispatch attempts across all tasks"
    )
    .ok();
    writeln!(output, "# TYPE waypoint_task_failed_attempts gauge").ok();
    writeln!(output, "waypoint_task_failed_attempts {attempts}").ok();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::manager::NewTask;
    use serde_json::json;

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let state = AppState::new(Config::default());
        let output = collect_metrics(&state).await.unwrap();

        assert!(output.contains("waypoint_workers{status=\"online\"} 0"));
        assert!(output.contains("waypoint_tasks{state=\"pending\"} 0"));
        assert!(output.contains("waypoint_task_failed_attempts 0"));
    }

    #[tokio::test]
    async fn test_collect_metrics_counts_tasks() {
        let state = AppState::new(Config::default());
        for _ in 0..2 {
            state
                .manager
                .create_task(NewTask {
                    task_type: "build".into(),
                    owner: "alice".into(),
                    payload: json!(null),
                    max_attempts: None,
                    dependencies: Vec::new(),
                })
                .await
                .unwrap();
        }

        let output = collect_metrics(&state).await.unwrap();
        assert!(output.contains("waypoint_tasks{state=\"pending\"} 2"));
        assert!(output.contains("waypoint_tasks{state=\"running\"} 0"));
    }
}
