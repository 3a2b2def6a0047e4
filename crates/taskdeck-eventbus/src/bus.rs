use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use taskdeck_protocol::{SessionEvent, TaskId};
use tokio::sync::broadcast;

use crate::envelope::SessionEventEnvelope;

pub const DEFAULT_TASK_BUFFER_CAPACITY: usize = 256;
pub const DEFAULT_GLOBAL_BUFFER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEventBusConfig {
    pub task_buffer_capacity: usize,
    pub global_buffer_capacity: usize,
}

impl Default for SessionEventBusConfig {
    fn default() -> Self {
        Self {
            task_buffer_capacity: DEFAULT_TASK_BUFFER_CAPACITY,
            global_buffer_capacity: DEFAULT_GLOBAL_BUFFER_CAPACITY,
        }
    }
}

/// Broadcasts session events to per-task and global subscribers.
///
/// Slow subscribers observe `RecvError::Lagged` rather than blocking
/// publishers. Publishing with no subscribers still allocates a sequence.
#[derive(Debug)]
pub struct SessionEventBus {
    next_sequence: AtomicU64,
    boot_instant: Instant,
    config: SessionEventBusConfig,
    task_senders: RwLock<HashMap<TaskId, broadcast::Sender<SessionEventEnvelope>>>,
    global_sender: broadcast::Sender<SessionEventEnvelope>,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new(SessionEventBusConfig::default())
    }
}

impl SessionEventBus {
    /// Zero capacities are raised to one.
    pub fn new(config: SessionEventBusConfig) -> Self {
        let config = SessionEventBusConfig {
            task_buffer_capacity: config.task_buffer_capacity.max(1),
            global_buffer_capacity: config.global_buffer_capacity.max(1),
        };
        let (global_sender, _global_receiver) = broadcast::channel(config.global_buffer_capacity);
        Self {
            next_sequence: AtomicU64::new(0),
            boot_instant: Instant::now(),
            config,
            task_senders: RwLock::new(HashMap::new()),
            global_sender,
        }
    }

    pub fn subscribe_task(&self, task_id: TaskId) -> broadcast::Receiver<SessionEventEnvelope> {
        if let Some(sender) = self.task_sender(&task_id) {
            return sender.subscribe();
        }

        let mut task_senders = self
            .task_senders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = task_senders.entry(task_id).or_insert_with(|| {
            let (sender, _receiver) = broadcast::channel(self.config.task_buffer_capacity);
            sender
        });
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<SessionEventEnvelope> {
        self.global_sender.subscribe()
    }

    /// Drops the task channel; its subscribers observe `Closed` once drained.
    pub fn remove_task(&self, task_id: &TaskId) -> bool {
        let mut task_senders = self
            .task_senders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        task_senders.remove(task_id).is_some()
    }

    pub fn publish(&self, event: SessionEvent) -> SessionEventEnvelope {
        let envelope = SessionEventEnvelope {
            task_id: event.task_id().clone(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1,
            published_at_monotonic_nanos: self.monotonic_nanos_since_boot(),
            event,
        };

        if let Some(sender) = self.task_sender(&envelope.task_id) {
            if sender.receiver_count() > 0 {
                let _ = sender.send(envelope.clone());
            } else {
                self.prune_abandoned(&envelope.task_id);
            }
        }
        if self.global_sender.receiver_count() > 0 {
            let _ = self.global_sender.send(envelope.clone());
        }

        envelope
    }

    pub fn task_channel_count(&self) -> usize {
        self.task_senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops a task channel whose subscribers have all gone away.
    fn prune_abandoned(&self, task_id: &TaskId) {
        let mut task_senders = self
            .task_senders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if task_senders
            .get(task_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            task_senders.remove(task_id);
        }
    }

    fn task_sender(&self, task_id: &TaskId) -> Option<broadcast::Sender<SessionEventEnvelope>> {
        let task_senders = self
            .task_senders
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        task_senders.get(task_id).cloned()
    }

    fn monotonic_nanos_since_boot(&self) -> u64 {
        let nanos = self.boot_instant.elapsed().as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use taskdeck_protocol::{SessionEvent, SessionStatus, StatusEvent, TaskId};
    use tokio::sync::broadcast::error::RecvError;
    use tokio::time::timeout;

    use super::{SessionEventBus, SessionEventBusConfig};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    fn status_event(task: &str, to: SessionStatus) -> SessionEvent {
        SessionEvent::Status(StatusEvent {
            task_id: TaskId::new(task),
            session_id: None,
            from: SessionStatus::Idle,
            to,
            reason: None,
        })
    }

    #[test]
    fn publish_assigns_increasing_sequences_and_task_ids() {
        let bus = SessionEventBus::default();

        let first = bus.publish(status_event("task-a", SessionStatus::Working));
        let second = bus.publish(status_event("task-b", SessionStatus::Error));

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.task_id, TaskId::new("task-a"));
        assert_eq!(second.task_id, TaskId::new("task-b"));
        assert!(second.published_at_monotonic_nanos >= first.published_at_monotonic_nanos);
    }

    #[tokio::test]
    async fn task_subscribers_only_see_their_task_and_global_sees_all() {
        let bus = SessionEventBus::default();
        let mut task_a = bus.subscribe_task(TaskId::new("task-a"));
        let mut global = bus.subscribe_all();

        let published_b = bus.publish(status_event("task-b", SessionStatus::Working));
        let published_a = bus.publish(status_event("task-a", SessionStatus::Working));

        let received_a = timeout(TEST_TIMEOUT, task_a.recv())
            .await
            .expect("task recv timed out")
            .expect("task recv should succeed");
        assert_eq!(received_a, published_a);

        let first_global = timeout(TEST_TIMEOUT, global.recv())
            .await
            .expect("global recv timed out")
            .expect("global recv should succeed");
        let second_global = timeout(TEST_TIMEOUT, global.recv())
            .await
            .expect("global recv timed out")
            .expect("global recv should succeed");
        assert_eq!(first_global, published_b);
        assert_eq!(second_global, published_a);
    }

    #[tokio::test]
    async fn slow_global_subscriber_observes_lag() {
        let bus = SessionEventBus::new(SessionEventBusConfig {
            task_buffer_capacity: 1,
            global_buffer_capacity: 1,
        });
        let mut global = bus.subscribe_all();

        for _ in 0..4 {
            let _ = bus.publish(status_event("task-a", SessionStatus::Working));
        }

        let lagged = timeout(TEST_TIMEOUT, global.recv())
            .await
            .expect("global recv timed out")
            .expect_err("expected lagged receiver");
        assert!(matches!(lagged, RecvError::Lagged(skipped) if skipped >= 1));
    }

    #[tokio::test]
    async fn remove_task_closes_subscribers_and_resubscribe_recreates_channel() {
        let bus = SessionEventBus::default();
        let task = TaskId::new("task-a");
        let mut subscriber = bus.subscribe_task(task.clone());

        assert!(bus.remove_task(&task));
        assert!(!bus.remove_task(&task));
        let closed = timeout(TEST_TIMEOUT, subscriber.recv())
            .await
            .expect("task recv timed out")
            .expect_err("subscription should close");
        assert!(matches!(closed, RecvError::Closed));

        let mut refreshed = bus.subscribe_task(task);
        let published = bus.publish(status_event("task-a", SessionStatus::Working));
        let received = timeout(TEST_TIMEOUT, refreshed.recv())
            .await
            .expect("task recv timed out")
            .expect("task recv should succeed");
        assert_eq!(received, published);
    }

    #[test]
    fn publishing_prunes_task_channels_without_subscribers() {
        let bus = SessionEventBus::default();
        let mut kept = bus.subscribe_task(TaskId::new("task-a"));
        drop(bus.subscribe_task(TaskId::new("task-b")));
        assert_eq!(bus.task_channel_count(), 2);

        let _ = bus.publish(status_event("task-b", SessionStatus::Working));
        let _ = bus.publish(status_event("task-a", SessionStatus::Working));

        assert_eq!(bus.task_channel_count(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn zero_capacity_config_is_raised_to_one() {
        let bus = SessionEventBus::new(SessionEventBusConfig {
            task_buffer_capacity: 0,
            global_buffer_capacity: 0,
        });
        let _receiver = bus.subscribe_task(TaskId::new("task-a"));
        let _ = bus.publish(status_event("task-a", SessionStatus::Working));
    }
}
