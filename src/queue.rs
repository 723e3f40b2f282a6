//! Priority queue of tasks that have not started yet.
//!
//! Ordering is `(priority ASC, created_at ASC, id ASC)`. Positions are 0-based
//! and count the entries strictly ahead of a task. They are recomputed on every
//! mutation so [`QueueManager::position_of`] is a map lookup.

use crate::events::{EventBroadcaster, TaskEvent};
use crate::types::{Priority, Task, TaskId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

type OrderKey = (Priority, i64, TaskId);

#[derive(Default)]
struct QueueState {
    order: BTreeMap<OrderKey, TaskId>,
    keys: HashMap<TaskId, OrderKey>,
    positions: HashMap<TaskId, usize>,
}

impl QueueState {
    fn reindex(&mut self) {
        self.positions.clear();
        for (position, id) in self.order.values().enumerate() {
            self.positions.insert(*id, position);
        }
    }

    fn insert(&mut self, task_id: TaskId, key: OrderKey) {
        if let Some(old) = self.keys.insert(task_id, key) {
            self.order.remove(&old);
        }
        self.order.insert(key, task_id);
        self.reindex();
    }

    fn take(&mut self, task_id: TaskId) -> bool {
        match self.keys.remove(&task_id) {
            Some(key) => {
                self.order.remove(&key);
                self.reindex();
                true
            }
            None => false,
        }
    }
}

pub struct QueueManager {
    state: Mutex<QueueState>,
    broadcaster: Arc<EventBroadcaster>,
}

impl QueueManager {
    pub fn new(broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            broadcaster,
        }
    }

    /// Add a not-yet-started task and return its position.
    ///
    /// Enqueueing a task that is already queued re-files it under its current
    /// priority.
    pub fn enqueue(&self, task: &Task) -> usize {
        let position = {
            let mut state = self.state.lock();
            state.insert(task.id, (task.priority, task.created_at, task.id));
            state.positions[&task.id]
        };
        debug!(task_id = task.id, position, priority = task.priority, "Task enqueued");
        self.broadcaster.publish(TaskEvent::TaskQueued {
            task_id: task.id,
            position,
        });
        position
    }

    /// Head of the queue, left in place until the caller has started it.
    pub fn peek_next(&self) -> Option<TaskId> {
        self.state.lock().order.values().next().copied()
    }

    /// Take a task off the queue because it has started. Returns whether it
    /// was queued.
    pub fn dequeue(&self, task_id: TaskId) -> bool {
        if !self.state.lock().take(task_id) {
            return false;
        }
        debug!(task_id, "Task dequeued");
        self.broadcaster
            .publish(TaskEvent::TaskDequeued { task_id });
        true
    }

    /// Drop a task that will no longer run. Returns whether it was queued.
    pub fn remove(&self, task_id: TaskId) -> bool {
        let removed = self.state.lock().take(task_id);
        if removed {
            debug!(task_id, "Task removed from queue");
        }
        removed
    }

    /// Move a queued task to a new priority. Returns its new position, or
    /// `None` if it is not queued.
    pub fn reprioritize(&self, task_id: TaskId, priority: Priority) -> Option<usize> {
        let mut state = self.state.lock();
        let (_, created_at, _) = *state.keys.get(&task_id)?;
        state.insert(task_id, (priority, created_at, task_id));
        state.positions.get(&task_id).copied()
    }

    pub fn position_of(&self, task_id: TaskId) -> Option<usize> {
        self.state.lock().positions.get(&task_id).copied()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.state.lock().keys.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued ids in run order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.state.lock().order.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BackpressurePolicy;
    use crate::types::{ExecutionMode, SessionMode, TaskStatus};

    fn task(id: TaskId, priority: Priority, created_at: i64) -> Task {
        Task {
            id,
            instruction: format!("task {id}"),
            script_content: None,
            base_branch: None,
            current_branch: None,
            ticket_key: None,
            skip_permissions: false,
            session_mode: SessionMode::New,
            execution_mode: ExecutionMode::Queued,
            status: TaskStatus::Queued,
            priority,
            queue_position: None,
            failure_reason: None,
            retry_count: 0,
            rate_limit_hits: 0,
            recovery_history: Vec::new(),
            created_at,
            started_at: None,
            completed_at: None,
            updated_at: created_at,
            archived: false,
            deleted_at: None,
        }
    }

    fn manager() -> (QueueManager, Arc<EventBroadcaster>) {
        let broadcaster = Arc::new(EventBroadcaster::new(32, BackpressurePolicy::DropOldest));
        (QueueManager::new(Arc::clone(&broadcaster)), broadcaster)
    }

    #[test]
    fn test_lower_priority_number_runs_first() {
        let (queue, _) = manager();
        queue.enqueue(&task(1, 5, 100));
        queue.enqueue(&task(2, 1, 200));

        assert_eq!(queue.peek_next(), Some(2));
        assert!(queue.dequeue(2));
        assert_eq!(queue.peek_next(), Some(1));
        assert!(queue.dequeue(1));
        assert_eq!(queue.peek_next(), None);
        assert!(!queue.dequeue(1));
    }

    #[test]
    fn test_ties_are_fifo() {
        let (queue, _) = manager();
        queue.enqueue(&task(3, 2, 300));
        queue.enqueue(&task(1, 2, 100));
        queue.enqueue(&task(2, 2, 100));

        assert_eq!(queue.ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_higher_priority_insert_shifts_positions_by_one() {
        let (queue, _) = manager();
        queue.enqueue(&task(1, 3, 100));
        queue.enqueue(&task(2, 5, 200));
        queue.enqueue(&task(3, 5, 300));
        assert_eq!(queue.position_of(2), Some(1));
        assert_eq!(queue.position_of(3), Some(2));

        let position = queue.enqueue(&task(4, 1, 400));

        assert_eq!(position, 0);
        assert_eq!(queue.position_of(1), Some(1));
        assert_eq!(queue.position_of(2), Some(2));
        assert_eq!(queue.position_of(3), Some(3));
    }

    #[test]
    fn test_remove_recomputes_positions_behind() {
        let (queue, _) = manager();
        for id in 1..=4 {
            queue.enqueue(&task(id, 5, id * 10));
        }

        assert!(queue.remove(2));
        assert!(!queue.remove(2));

        assert_eq!(queue.position_of(1), Some(0));
        assert_eq!(queue.position_of(2), None);
        assert_eq!(queue.position_of(3), Some(1));
        assert_eq!(queue.position_of(4), Some(2));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_reprioritize_moves_task() {
        let (queue, _) = manager();
        queue.enqueue(&task(1, 5, 10));
        queue.enqueue(&task(2, 5, 20));

        assert_eq!(queue.reprioritize(2, 0), Some(0));
        assert_eq!(queue.position_of(1), Some(1));
        assert_eq!(queue.reprioritize(99, 0), None);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_queue_events() {
        let (queue, broadcaster) = manager();
        let mut sub = broadcaster.subscribe();

        queue.enqueue(&task(7, 5, 10));
        assert_eq!(queue.peek_next(), Some(7));
        assert_eq!(sub.try_recv().map(|e| e.kind()), Some("TASK_QUEUED"));
        assert!(queue.dequeue(7));

        assert_eq!(sub.try_recv(), Some(TaskEvent::TaskDequeued { task_id: 7 }));
        // Peeking alone never announces a dequeue.
        queue.enqueue(&task(8, 5, 20));
        queue.peek_next();
        assert_eq!(
            sub.try_recv(),
            Some(TaskEvent::TaskQueued {
                task_id: 8,
                position: 0
            })
        );
        assert_eq!(sub.try_recv(), None);
    }
}
