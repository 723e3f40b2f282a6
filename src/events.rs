//! Event broadcast to connected observers.
//!
//! Each observer gets its own bounded queue. A slow observer never blocks the
//! publisher: when its queue is full the configured [`BackpressurePolicy`]
//! either drops the oldest pending event or disconnects it. An observer that
//! missed events calls [`EventBroadcaster::snapshot`] to resynchronize.

use crate::types::{RunnerStatus, SystemState, Task, TaskId, TaskStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Transient notification pushed to observers. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEvent {
    TaskQueued { task_id: TaskId, position: usize },
    TaskDequeued { task_id: TaskId },
    StatusUpdate { task_id: TaskId, status: TaskStatus, task: Box<Task> },
    TaskInterrupted { task_id: TaskId, reason: String },
    TaskStarted { task_id: TaskId, task: Box<Task> },
    Log { task_id: TaskId, line: String, is_error: bool },
    System { message: String },
    SystemReady,
    SystemDisconnected { reason: Option<String> },
}

impl TaskEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskQueued { .. } => "TASK_QUEUED",
            Self::TaskDequeued { .. } => "TASK_DEQUEUED",
            Self::StatusUpdate { .. } => "STATUS_UPDATE",
            Self::TaskInterrupted { .. } => "TASK_INTERRUPTED",
            Self::TaskStarted { .. } => "TASK_STARTED",
            Self::Log { .. } => "LOG",
            Self::System { .. } => "SYSTEM",
            Self::SystemReady => "SYSTEM_READY",
            Self::SystemDisconnected { .. } => "SYSTEM_DISCONNECTED",
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskQueued { task_id, .. }
            | Self::TaskDequeued { task_id }
            | Self::StatusUpdate { task_id, .. }
            | Self::TaskInterrupted { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::Log { task_id, .. } => Some(*task_id),
            Self::System { .. } | Self::SystemReady | Self::SystemDisconnected { .. } => None,
        }
    }
}

/// What to do when an observer's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Discard the oldest pending event to make room.
    #[default]
    DropOldest,
    /// Close the observer; it must resubscribe and take a snapshot.
    Disconnect,
}

/// Provider of the live values behind [`SystemState`].
pub trait SnapshotSource: Send + Sync {
    fn system_state(&self) -> SystemState;
}

struct ObserverQueue {
    events: Mutex<VecDeque<TaskEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl ObserverQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Publishes lifecycle and log events to every subscribed observer.
pub struct EventBroadcaster {
    observers: Mutex<HashMap<u64, Arc<ObserverQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
    policy: BackpressurePolicy,
    source: OnceLock<Weak<dyn SnapshotSource>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            policy,
            source: OnceLock::new(),
        }
    }

    /// Register the provider used by [`snapshot`](Self::snapshot). Only the
    /// first registration takes effect.
    pub fn set_source(&self, source: Weak<dyn SnapshotSource>) {
        if self.source.set(source).is_err() {
            warn!("Snapshot source already registered; ignoring");
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ObserverQueue::new(self.capacity));
        self.observers.lock().insert(id, Arc::clone(&queue));
        debug!(observer = id, "Observer subscribed");
        Subscription { id, queue }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(|_, q| !q.is_closed());
        observers.len()
    }

    /// Deliver `event` to every current observer without blocking.
    pub fn publish(&self, event: TaskEvent) {
        let mut observers = self.observers.lock();
        observers.retain(|id, queue| {
            if queue.is_closed() {
                return false;
            }
            let mut pending = queue.events.lock();
            if pending.len() >= self.capacity {
                match self.policy {
                    BackpressurePolicy::DropOldest => {
                        pending.pop_front();
                        queue.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    BackpressurePolicy::Disconnect => {
                        warn!(observer = id, event = event.kind(), "Observer queue full; disconnecting");
                        pending.clear();
                        drop(pending);
                        queue.close();
                        return false;
                    }
                }
            }
            pending.push_back(event.clone());
            drop(pending);
            queue.notify.notify_one();
            true
        });
    }

    /// Current system state for a (re)attaching observer.
    pub fn snapshot(&self) -> SystemState {
        match self.source.get().and_then(Weak::upgrade) {
            Some(source) => source.system_state(),
            None => SystemState {
                connected: false,
                rate_limited: false,
                runner_status: RunnerStatus::Idle,
                running_tasks: Vec::new(),
                queued_count: 0,
                timestamp: crate::db::now_ms(),
            },
        }
    }
}

/// Receiving end of one observer.
pub struct Subscription {
    id: u64,
    queue: Arc<ObserverQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the observer was disconnected and drained.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            if let Some(event) = self.queue.events.lock().pop_front() {
                return Some(event);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Events discarded by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn is_disconnected(&self) -> bool {
        self.queue.is_closed()
    }

    /// Adapt into a stream for transports such as SSE.
    pub fn into_stream(self) -> impl futures::Stream<Item = TaskEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(n: usize) -> TaskEvent {
        TaskEvent::Log {
            task_id: 1,
            line: format!("line {n}"),
            is_error: false,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broadcaster = EventBroadcaster::new(8, BackpressurePolicy::DropOldest);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish(TaskEvent::TaskDequeued { task_id: 4 });

        assert_eq!(a.recv().await, Some(TaskEvent::TaskDequeued { task_id: 4 }));
        assert_eq!(b.recv().await, Some(TaskEvent::TaskDequeued { task_id: 4 }));
        assert_eq!(broadcaster.subscriber_count(), 2);
    }

    #[test]
    fn test_drop_oldest_keeps_latest_events() {
        let broadcaster = EventBroadcaster::new(3, BackpressurePolicy::DropOldest);
        let mut sub = broadcaster.subscribe();

        for n in 0..5 {
            broadcaster.publish(log(n));
        }

        assert_eq!(sub.dropped(), 2);
        assert_eq!(sub.try_recv(), Some(log(2)));
        assert_eq!(sub.try_recv(), Some(log(3)));
        assert_eq!(sub.try_recv(), Some(log(4)));
        assert_eq!(sub.try_recv(), None);
        assert!(!sub.is_disconnected());
    }

    #[tokio::test]
    async fn test_disconnect_policy_closes_slow_observer() {
        let broadcaster = EventBroadcaster::new(2, BackpressurePolicy::Disconnect);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        broadcaster.publish(log(0));
        assert_eq!(fast.recv().await, Some(log(0)));
        broadcaster.publish(log(1));
        assert_eq!(fast.recv().await, Some(log(1)));
        broadcaster.publish(log(2));

        assert!(slow.is_disconnected());
        assert_eq!(slow.recv().await, None);
        assert_eq!(fast.recv().await, Some(log(2)));
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let broadcaster = EventBroadcaster::new(4, BackpressurePolicy::DropOldest);
        let sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(sub);
        broadcaster.publish(log(0));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_snapshot_without_source_reports_idle() {
        let broadcaster = EventBroadcaster::new(4, BackpressurePolicy::DropOldest);
        let state = broadcaster.snapshot();
        assert!(!state.connected);
        assert_eq!(state.runner_status, RunnerStatus::Idle);
        assert_eq!(state.queued_count, 0);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(TaskEvent::TaskQueued {
            task_id: 3,
            position: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "TASK_QUEUED");
        assert_eq!(json["position"], 1);

        let json = serde_json::to_value(TaskEvent::SystemReady).unwrap();
        assert_eq!(json["type"], "SYSTEM_READY");
    }
}
