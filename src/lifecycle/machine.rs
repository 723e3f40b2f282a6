use super::table::{Trigger, next_state};
use crate::db::now_ms;
use crate::error::{RunnerError, RunnerResult};
use crate::events::{EventBroadcaster, TaskEvent};
use crate::store::TaskStore;
use crate::types::{ExecutionLog, Task, TaskId, TaskStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runner connectivity notices forwarded to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemNotice {
    Ready,
    Disconnected(Option<String>),
    Message(String),
}

/// Single writer for task status.
///
/// Transitions for the same task are serialized by a per-task async lock. The
/// destination status is written to the store before any event is published,
/// so a failed write leaves the durable status untouched and nothing is
/// announced.
pub struct LifecycleStateMachine {
    store: Arc<dyn TaskStore>,
    broadcaster: Arc<EventBroadcaster>,
    locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl LifecycleStateMachine {
    pub fn new(store: Arc<dyn TaskStore>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    fn lock_for(&self, task_id: TaskId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(task_id).or_default())
    }

    fn forget_lock(&self, task_id: TaskId) {
        self.locks.lock().remove(&task_id);
    }

    fn load(&self, task_id: TaskId) -> RunnerResult<Task> {
        self.store
            .find_by_id(task_id)?
            .ok_or(RunnerError::TaskNotFound(task_id))
    }

    /// Current durable status.
    pub fn status_of(&self, task_id: TaskId) -> RunnerResult<TaskStatus> {
        Ok(self.load(task_id)?.status)
    }

    /// Apply `trigger` to the task and return the updated record.
    ///
    /// `reason` becomes the failure reason for failing, interrupting and
    /// killing transitions.
    pub async fn transition(
        &self,
        task_id: TaskId,
        trigger: Trigger,
        reason: Option<String>,
    ) -> RunnerResult<Task> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let mut task = self.load(task_id)?;
        let from = task.status;
        let Some(to) = next_state(from, trigger) else {
            warn!(task_id, %from, %trigger, "Rejected invalid transition");
            return Err(RunnerError::InvalidTransition {
                task_id,
                from,
                trigger,
            });
        };

        let now = now_ms();
        task.status = to;
        task.updated_at = now;
        if to == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if to.is_terminal() {
            task.completed_at = Some(now);
        }
        if matches!(
            trigger,
            Trigger::Fail | Trigger::GiveUp | Trigger::Interrupt | Trigger::Kill | Trigger::ForceStopped
        ) {
            if let Some(reason) = reason.clone() {
                task.failure_reason = Some(reason);
            }
        }

        self.store.update(&task).map_err(RunnerError::Store)?;
        info!(task_id, %from, %to, %trigger, "Task transitioned");

        match trigger {
            Trigger::Start => self.broadcaster.publish(TaskEvent::TaskStarted {
                task_id,
                task: Box::new(task.clone()),
            }),
            Trigger::Interrupt => self.broadcaster.publish(TaskEvent::TaskInterrupted {
                task_id,
                reason: reason.unwrap_or_else(|| "agent exited unexpectedly".to_string()),
            }),
            _ => {}
        }
        self.broadcaster.publish(TaskEvent::StatusUpdate {
            task_id,
            status: to,
            task: Box::new(task.clone()),
        });

        if to.is_terminal() {
            drop(_guard);
            self.forget_lock(task_id);
        }
        Ok(task)
    }

    /// Persist a non-status change (recovery history, priority, archival)
    /// under the same per-task lock as transitions.
    pub async fn update_with<R>(
        &self,
        task_id: TaskId,
        f: impl FnOnce(&mut Task) -> RunnerResult<R>,
    ) -> RunnerResult<(Task, R)> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let mut task = self.load(task_id)?;
        let status = task.status;
        let out = f(&mut task)?;
        debug_assert_eq!(task.status, status, "update_with must not change status");
        task.status = status;
        task.updated_at = now_ms();
        self.store.update(&task).map_err(RunnerError::Store)?;
        Ok((task, out))
    }

    /// Append an output chunk and announce it.
    pub fn record_log(
        &self,
        task_id: TaskId,
        line: &str,
        is_error: bool,
    ) -> RunnerResult<ExecutionLog> {
        let entry = self
            .store
            .append_log(task_id, line, is_error)
            .map_err(RunnerError::Store)?;
        self.broadcaster.publish(TaskEvent::Log {
            task_id,
            line: entry.chunk.clone(),
            is_error,
        });
        Ok(entry)
    }

    pub fn system_notice(&self, notice: SystemNotice) {
        debug!(?notice, "Runner notice");
        let event = match notice {
            SystemNotice::Ready => TaskEvent::SystemReady,
            SystemNotice::Disconnected(reason) => TaskEvent::SystemDisconnected { reason },
            SystemNotice::Message(message) => TaskEvent::System { message },
        };
        self.broadcaster.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::BackpressurePolicy;
    use crate::types::NewTask;

    fn setup() -> (LifecycleStateMachine, Arc<EventBroadcaster>, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let broadcaster = Arc::new(EventBroadcaster::new(64, BackpressurePolicy::DropOldest));
        let machine = LifecycleStateMachine::new(db.clone(), Arc::clone(&broadcaster));
        (machine, broadcaster, db)
    }

    #[tokio::test]
    async fn test_start_sets_started_at_and_announces() {
        let (machine, broadcaster, db) = setup();
        let mut sub = broadcaster.subscribe();
        let task = db.create(&NewTask::new("write docs"), TaskStatus::Queued).unwrap();

        let running = machine.transition(task.id, Trigger::Start, None).await.unwrap();

        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(sub.try_recv().unwrap().kind(), "TASK_STARTED");
        match sub.try_recv().unwrap() {
            TaskEvent::StatusUpdate { status, .. } => assert_eq!(status, TaskStatus::Running),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_status_unchanged() {
        let (machine, broadcaster, db) = setup();
        let task = db.create(&NewTask::new("noop"), TaskStatus::Queued).unwrap();
        let mut sub = broadcaster.subscribe();

        let err = machine
            .transition(task.id, Trigger::Complete, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunnerError::InvalidTransition {
                from: TaskStatus::Queued,
                trigger: Trigger::Complete,
                ..
            }
        ));
        assert_eq!(machine.status_of(task.id).unwrap(), TaskStatus::Queued);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_late_requests() {
        let (machine, _broadcaster, db) = setup();
        let task = db.create(&NewTask::new("race"), TaskStatus::Queued).unwrap();
        machine.transition(task.id, Trigger::Start, None).await.unwrap();
        let done = machine.transition(task.id, Trigger::Complete, None).await.unwrap();
        assert!(done.completed_at.is_some());

        let late = machine.transition(task.id, Trigger::Cancel, None).await;
        assert!(matches!(late, Err(RunnerError::InvalidTransition { .. })));
        assert_eq!(machine.status_of(task.id).unwrap(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_to_one_winner() {
        let (machine, _broadcaster, db) = setup();
        let machine = Arc::new(machine);
        let task = db.create(&NewTask::new("contended"), TaskStatus::Queued).unwrap();
        machine.transition(task.id, Trigger::Start, None).await.unwrap();

        let complete = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.transition(task.id, Trigger::Complete, None).await })
        };
        let fail = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move {
                machine
                    .transition(task.id, Trigger::Fail, Some("boom".into()))
                    .await
            })
        };

        let outcomes = [complete.await.unwrap(), fail.await.unwrap()];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let status = machine.status_of(task.id).unwrap();
        assert!(status == TaskStatus::Completed || status == TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_fail_records_reason() {
        let (machine, _broadcaster, db) = setup();
        let task = db.create(&NewTask::new("flaky"), TaskStatus::Queued).unwrap();
        machine.transition(task.id, Trigger::Start, None).await.unwrap();
        let failed = machine
            .transition(task.id, Trigger::Fail, Some("tests failed".into()))
            .await
            .unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("tests failed"));
    }

    #[tokio::test]
    async fn test_log_is_persisted_then_published() {
        let (machine, broadcaster, db) = setup();
        let task = db.create(&NewTask::new("chatty"), TaskStatus::Queued).unwrap();
        let mut sub = broadcaster.subscribe();

        machine.record_log(task.id, "hello", false).unwrap();
        machine.record_log(task.id, "oops", true).unwrap();

        let logs = db.find_logs(task.id, None, None).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[1].is_error);
        assert_eq!(
            sub.try_recv(),
            Some(TaskEvent::Log {
                task_id: task.id,
                line: "hello".into(),
                is_error: false
            })
        );
    }
}
