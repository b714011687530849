//! Event Bus
//!
//! In-process fan-out over `tokio::sync::broadcast`: one aggregate channel
//! carrying every event, plus one lazily created channel per task key that is
//! closed once the task's terminal event has been delivered.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use super::TaskEvent;
use crate::core::TaskKey;

/// Publish/subscribe hub for task events
pub struct EventBus {
    all: broadcast::Sender<TaskEvent>,
    per_task: Mutex<HashMap<TaskKey, broadcast::Sender<TaskEvent>>>,
    capacity: usize,
}

impl EventBus {
    /// Creates a bus whose channels each buffer `capacity` events.
    ///
    /// Subscribers that fall further behind observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            all,
            per_task: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn task_senders(&self) -> MutexGuard<'_, HashMap<TaskKey, broadcast::Sender<TaskEvent>>> {
        self.per_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes an event. Never blocks; having no subscribers is fine.
    pub fn publish(&self, event: TaskEvent) {
        debug!(
            task_key = %event.task_key(),
            event = event.kind(),
            "Publishing task event"
        );

        {
            let mut senders = self.task_senders();
            if event.is_terminal() {
                // Dropping the sender closes the channel after this last event.
                if let Some(tx) = senders.remove(event.task_key()) {
                    let _ = tx.send(event.clone());
                }
            } else if let Some(tx) = senders.get(event.task_key()) {
                if tx.send(event.clone()).is_err() {
                    senders.remove(event.task_key());
                }
            }
        }

        let _ = self.all.send(event);
    }

    /// Subscribes to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.all.subscribe()
    }

    /// Subscribes to the events of one task key.
    ///
    /// The channel closes after the task's terminal event.
    pub fn subscribe_task(&self, task_key: &str) -> broadcast::Receiver<TaskEvent> {
        let mut senders = self.task_senders();
        senders
            .entry(task_key.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Number of per-task channels currently open
    pub fn task_channel_count(&self) -> usize {
        self.task_senders().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{Phase, ProgressEvent};
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn progress(key: &str, percent: u8) -> TaskEvent {
        TaskEvent::Progress(ProgressEvent::new(key, Phase::Tiling, percent))
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(8);
        bus.publish(progress("a", 10));
        bus.publish(TaskEvent::cancelled("a"));
    }

    #[tokio::test]
    async fn test_aggregate_receives_all_keys() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(progress("a", 10));
        bus.publish(progress("b", 20));

        assert_eq!(rx.recv().await.unwrap().task_key(), "a");
        assert_eq!(rx.recv().await.unwrap().task_key(), "b");
    }

    #[tokio::test]
    async fn test_task_channel_filters_and_closes_on_terminal() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_task("a");

        bus.publish(progress("b", 10));
        bus.publish(progress("a", 40));
        bus.publish(TaskEvent::cancelled("a"));

        assert!(matches!(rx.recv().await.unwrap(), TaskEvent::Progress(p) if p.percent == 40));
        assert!(matches!(rx.recv().await.unwrap(), TaskEvent::Cancelled { .. }));
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert_eq!(bus.task_channel_count(), 0);
    }

    #[test]
    fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for percent in 0..10 {
            bus.publish(progress("a", percent));
        }

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(_))));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_per_task_order_is_preserved() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_task("a");

        for percent in [5, 10, 15] {
            bus.publish(progress("a", percent));
        }

        let seen: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                TaskEvent::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect();
        assert_eq!(seen, vec![5, 10, 15]);
    }
}
