//! Lifecycle event fan-out.

use tokio::sync::broadcast;
use tracing::trace;

use waypoint_core::LifecycleEvent;

/// Bounded broadcast of committed task transitions.
///
/// Publishing never blocks. Subscribers that fall behind by more than the
/// channel capacity observe `RecvError::Lagged` and lose the skipped events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        trace!(
            task_id = %event.task_id,
            from = %event.from,
            to = %event.to,
            "Publishing lifecycle event"
        );
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::{TaskId, TaskState};

    fn event(id: &str) -> LifecycleEvent {
        LifecycleEvent::new(TaskId::new(id), TaskState::Pending, TaskState::Assigned)
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(event("t1")), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        bus.publish(event("t1"));
        bus.publish(event("t2"));

        assert_eq!(rx.recv().await.unwrap().task_id.as_str(), "t1");
        assert_eq!(rx.recv().await.unwrap().task_id.as_str(), "t2");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(&format!("t{i}")));
        }

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().task_id.as_str(), "t3");
    }
}
