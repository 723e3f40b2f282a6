//! Runner supervisor: owner of the single execution slot.
//!
//! At most one task is in an active status at a time. The slot is claimed
//! atomically with [`RunnerSupervisor::try_reserve`] before a task is started,
//! and released when the task reaches a terminal status.
//!
//! Agent signals and the control operations that start agent sessions are
//! serialized by one async gate, so a signal is never applied against a
//! status that is about to change underneath it. The gate is not held while
//! waiting for a cancellation acknowledgement or a forced stop.

use crate::agent::{Agent, AgentSignal, SessionRequest, SignalSender};
use crate::config::RunnerConfig;
use crate::db::now_ms;
use crate::error::{RunnerError, RunnerResult};
use crate::events::SnapshotSource;
use crate::lifecycle::{LifecycleStateMachine, SystemNotice, Trigger};
use crate::queue::QueueManager;
use crate::recovery::RecoveryPolicy;
use crate::types::{
    RecoveryAction, RecoveryResult, RunnerStatus, SessionMode, SystemState, Task, TaskId,
    TaskStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub cancel_timeout: Duration,
    pub kill_timeout: Duration,
    pub escalate_cancel_to_kill: bool,
}

impl From<&RunnerConfig> for SupervisorSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            cancel_timeout: config.cancel_timeout(),
            kill_timeout: config.kill_timeout(),
            escalate_cancel_to_kill: config.escalate_cancel_to_kill,
        }
    }
}

#[derive(Debug)]
struct ActiveTask {
    task_id: TaskId,
    backoff: Option<AbortHandle>,
}

#[derive(Debug)]
enum Slot {
    Idle,
    /// Claimed by a start that has not committed a task yet.
    Reserved,
    Active(ActiveTask),
}

/// Claim on the execution slot. Dropping it before [`commit`](Self::commit)
/// frees the slot again.
pub struct SlotReservation {
    slot: Arc<Mutex<Slot>>,
    idle: Arc<Notify>,
    committed: bool,
}

impl SlotReservation {
    fn commit(mut self, task_id: TaskId) {
        *self.slot.lock() = Slot::Active(ActiveTask {
            task_id,
            backoff: None,
        });
        self.committed = true;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Reserved) {
            *slot = Slot::Idle;
            drop(slot);
            self.idle.notify_one();
        }
    }
}

pub struct RunnerSupervisor {
    machine: Arc<LifecycleStateMachine>,
    queue: Arc<QueueManager>,
    agent: Arc<dyn Agent>,
    policy: RecoveryPolicy,
    settings: SupervisorSettings,
    signals: SignalSender,
    slot: Arc<Mutex<Slot>>,
    idle: Arc<Notify>,
    gate: tokio::sync::Mutex<()>,
    cancel_waiters: Mutex<HashMap<TaskId, Vec<oneshot::Sender<()>>>>,
    connected: AtomicBool,
    rate_limited: AtomicBool,
}

impl RunnerSupervisor {
    pub fn new(
        machine: Arc<LifecycleStateMachine>,
        queue: Arc<QueueManager>,
        agent: Arc<dyn Agent>,
        policy: RecoveryPolicy,
        settings: SupervisorSettings,
        signals: SignalSender,
    ) -> Self {
        Self {
            machine,
            queue,
            agent,
            policy,
            settings,
            signals,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            idle: Arc::new(Notify::new()),
            gate: tokio::sync::Mutex::new(()),
            cancel_waiters: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            rate_limited: AtomicBool::new(false),
        }
    }

    /// Notified whenever the slot becomes free.
    pub fn idle_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.idle)
    }

    pub fn active_task(&self) -> Option<TaskId> {
        match &*self.slot.lock() {
            Slot::Active(active) => Some(active.task_id),
            Slot::Idle | Slot::Reserved => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Idle)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::Acquire)
    }

    /// Claim the slot or fail fast with `RunnerBusy`.
    pub fn try_reserve(&self) -> RunnerResult<SlotReservation> {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Idle) {
            return Err(RunnerError::RunnerBusy {
                active: self.active_task_locked(&slot),
            });
        }
        *slot = Slot::Reserved;
        Ok(SlotReservation {
            slot: Arc::clone(&self.slot),
            idle: Arc::clone(&self.idle),
            committed: false,
        })
    }

    fn release(&self, task_id: TaskId) {
        let mut slot = self.slot.lock();
        let Slot::Active(active) = &*slot else {
            return;
        };
        if active.task_id != task_id {
            return;
        }
        if let Some(backoff) = &active.backoff {
            backoff.abort();
        }
        *slot = Slot::Idle;
        drop(slot);
        self.rate_limited.store(false, Ordering::Release);
        debug!(task_id, "Execution slot released");
        self.idle.notify_one();
    }

    fn set_backoff(&self, task_id: TaskId, handle: Option<AbortHandle>) {
        let mut slot = self.slot.lock();
        if let Slot::Active(active) = &mut *slot {
            if active.task_id == task_id {
                if let Some(old) = std::mem::replace(&mut active.backoff, handle) {
                    old.abort();
                }
                return;
            }
        }
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn load(&self, task_id: TaskId) -> RunnerResult<Task> {
        self.machine
            .store()
            .find_by_id(task_id)?
            .ok_or(RunnerError::TaskNotFound(task_id))
    }

    fn active_or_err(&self) -> RunnerResult<TaskId> {
        self.active_task().ok_or(RunnerError::NoActiveTask)
    }

    /// Start a not-yet-started task. Fails with `RunnerBusy` unless idle.
    pub async fn start(&self, task_id: TaskId) -> RunnerResult<Task> {
        let reservation = self.try_reserve()?;
        self.launch(reservation, task_id).await
    }

    /// Start the head of the queue.
    ///
    /// The head leaves the queue only once its RUNNING status is stored, so a
    /// failed write leaves it queued for the next pass.
    pub async fn start_next(&self) -> RunnerResult<Task> {
        let reservation = self.try_reserve()?;
        let _gate = self.gate.lock().await;
        let task_id = self.queue.peek_next().ok_or(RunnerError::QueueEmpty)?;
        let task = match self.machine.transition(task_id, Trigger::Start, None).await {
            Ok(task) => task,
            // The row moved on without the queue; it can never start.
            Err(e @ (RunnerError::InvalidTransition { .. } | RunnerError::TaskNotFound(_))) => {
                self.queue.remove(task_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.queue.dequeue(task_id);
        self.hand_off(reservation, task).await
    }

    /// Move a task into the reserved slot and hand it to the agent.
    pub async fn launch(&self, reservation: SlotReservation, task_id: TaskId) -> RunnerResult<Task> {
        let _gate = self.gate.lock().await;
        let task = self.machine.transition(task_id, Trigger::Start, None).await?;
        self.hand_off(reservation, task).await
    }

    /// Commit a freshly started task to the slot. The caller holds the gate.
    async fn hand_off(&self, reservation: SlotReservation, task: Task) -> RunnerResult<Task> {
        let task_id = task.id;
        reservation.commit(task_id);

        let request = SessionRequest::for_task(&task, false);
        if let Err(e) = self.agent.start(request).await {
            warn!(task_id, error = %e, "Agent failed to start task");
            self.machine
                .transition(
                    task_id,
                    Trigger::Interrupt,
                    Some(format!("Failed to start agent: {e:#}")),
                )
                .await?;
            return self.recover(task_id).await;
        }
        Ok(task)
    }

    pub async fn pause(&self) -> RunnerResult<Task> {
        let task_id = self.active_or_err()?;
        let status = self.machine.status_of(task_id)?;
        if status != TaskStatus::Running {
            return Err(RunnerError::InvalidTransition {
                task_id,
                from: status,
                trigger: Trigger::Pause,
            });
        }
        self.agent.pause(task_id).await.map_err(RunnerError::agent)?;
        self.machine.transition(task_id, Trigger::Pause, None).await
    }

    pub async fn resume(&self) -> RunnerResult<Task> {
        let task_id = self.active_or_err()?;
        let _gate = self.gate.lock().await;
        let task = self.machine.transition(task_id, Trigger::Resume, None).await?;
        self.resume_session(task).await
    }

    /// Lift a rate limit early instead of waiting out the backoff.
    pub async fn clear_rate_limit(&self) -> RunnerResult<Task> {
        let task_id = self.active_or_err()?;
        let _gate = self.gate.lock().await;
        self.limit_cleared(task_id).await
    }

    /// Cancel a task. Not-yet-started tasks are cancelled directly; an active
    /// task passes through CANCELLING until the agent acknowledges.
    pub async fn cancel(&self, task_id: TaskId) -> RunnerResult<Task> {
        let waiter = self.register_cancel_waiter(task_id);
        {
            let _gate = self.gate.lock().await;
            let current = self.load(task_id)?;
            if current.status != TaskStatus::Cancelling {
                let task = match self.machine.transition(task_id, Trigger::Cancel, None).await {
                    Ok(task) => task,
                    Err(e) => {
                        self.cancel_waiters.lock().remove(&task_id);
                        return Err(e);
                    }
                };
                if task.status == TaskStatus::Cancelled {
                    self.cancel_waiters.lock().remove(&task_id);
                    self.queue.remove(task_id);
                    return Ok(task);
                }
            }
            self.set_backoff(task_id, None);
            if let Err(e) = self.agent.cancel(task_id).await {
                warn!(task_id, error = %e, "Agent rejected cancel request");
            }
        }
        self.await_cancel(task_id, waiter).await
    }

    fn register_cancel_waiter(&self, task_id: TaskId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.cancel_waiters.lock().entry(task_id).or_default().push(tx);
        rx
    }

    async fn await_cancel(
        &self,
        task_id: TaskId,
        waiter: oneshot::Receiver<()>,
    ) -> RunnerResult<Task> {
        let timeout = self.settings.cancel_timeout;
        if tokio::time::timeout(timeout, waiter).await.is_ok() {
            return self.load(task_id);
        }

        self.cancel_waiters.lock().remove(&task_id);
        let task = self.load(task_id)?;
        if task.status != TaskStatus::Cancelling {
            return Ok(task);
        }
        if self.settings.escalate_cancel_to_kill {
            warn!(task_id, ?timeout, "Cancel not acknowledged; escalating to kill");
            return match self.kill(task_id).await {
                // Acknowledged after all, between the check above and the kill.
                Err(e @ RunnerError::InvalidTransition { .. }) => {
                    let task = self.load(task_id)?;
                    if task.status == TaskStatus::Cancelled {
                        debug!(task_id, "Late cancel acknowledgement won over kill");
                        Ok(task)
                    } else {
                        Err(e)
                    }
                }
                other => other,
            };
        }
        warn!(task_id, ?timeout, "Cancel not acknowledged");
        Err(RunnerError::CancelTimedOut { task_id, timeout })
    }

    /// Force-stop a running (or stuck cancelling) task.
    pub async fn kill(&self, task_id: TaskId) -> RunnerResult<Task> {
        {
            let _gate = self.gate.lock().await;
            if self.machine.status_of(task_id)? != TaskStatus::Terminating {
                self.machine
                    .transition(task_id, Trigger::Kill, Some("Killed by operator".to_string()))
                    .await?;
            }
            self.set_backoff(task_id, None);
        }

        let reason = match tokio::time::timeout(self.settings.kill_timeout, self.agent.kill(task_id))
            .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!("agent did not stop within {:?}", self.settings.kill_timeout)),
        };
        if let Some(reason) = reason {
            warn!(task_id, %reason, "Kill failed; task left TERMINATING");
            return Err(RunnerError::KillFailed { task_id, reason });
        }

        let _gate = self.gate.lock().await;
        let task = self
            .machine
            .transition(task_id, Trigger::ForceStopped, None)
            .await?;
        self.finish(task_id);
        Ok(task)
    }

    /// Apply one agent signal.
    pub async fn handle_signal(&self, signal: AgentSignal) -> RunnerResult<()> {
        match signal {
            AgentSignal::Connected => {
                self.connected.store(true, Ordering::Release);
                self.machine.system_notice(SystemNotice::Ready);
                Ok(())
            }
            AgentSignal::Disconnected { reason } => {
                self.connected.store(false, Ordering::Release);
                self.machine.system_notice(SystemNotice::Disconnected(reason));
                Ok(())
            }
            AgentSignal::Log {
                task_id,
                line,
                is_error,
            } => {
                self.machine.record_log(task_id, &line, is_error)?;
                Ok(())
            }
            other => {
                let _gate = self.gate.lock().await;
                self.apply(other).await
            }
        }
    }

    async fn apply(&self, signal: AgentSignal) -> RunnerResult<()> {
        let Some(task_id) = signal.task_id() else {
            return Ok(());
        };
        let status = self.machine.status_of(task_id)?;

        match (signal, status) {
            (AgentSignal::Completed { .. }, TaskStatus::Running) => {
                self.machine.transition(task_id, Trigger::Complete, None).await?;
                self.finish(task_id);
            }
            (AgentSignal::Failed { reason, .. }, TaskStatus::Running) => {
                self.machine
                    .transition(task_id, Trigger::Fail, Some(reason))
                    .await?;
                self.finish(task_id);
            }
            (AgentSignal::Exited { reason, .. }, TaskStatus::Running) => {
                self.machine
                    .transition(task_id, Trigger::Interrupt, Some(reason))
                    .await?;
                self.recover(task_id).await?;
            }
            (
                AgentSignal::CancelAcknowledged { .. }
                | AgentSignal::Completed { .. }
                | AgentSignal::Failed { .. }
                | AgentSignal::Exited { .. },
                TaskStatus::Cancelling,
            ) => {
                self.machine
                    .transition(task_id, Trigger::CancelConfirmed, None)
                    .await?;
                self.finish(task_id);
            }
            (AgentSignal::RateLimited { retry_after, .. }, TaskStatus::Running) => {
                self.rate_limit(task_id, retry_after).await?;
            }
            (AgentSignal::RateLimitCleared { .. }, TaskStatus::PausedByLimit) => {
                self.limit_cleared(task_id).await?;
            }
            (signal, status) => {
                debug!(task_id, %status, ?signal, "Ignoring signal for task in this status");
            }
        }
        Ok(())
    }

    /// Terminal status reached: free the slot and wake cancel waiters.
    fn finish(&self, task_id: TaskId) {
        self.release(task_id);
        if let Some(waiters) = self.cancel_waiters.lock().remove(&task_id) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    async fn rate_limit(&self, task_id: TaskId, retry_after: Option<Duration>) -> RunnerResult<()> {
        self.machine
            .transition(task_id, Trigger::RateLimit, None)
            .await?;
        self.rate_limited.store(true, Ordering::Release);
        let policy = &self.policy;
        let (task, delay) = self
            .machine
            .update_with(task_id, |task| Ok(policy.register_rate_limit(task, retry_after)))
            .await?;
        info!(task_id, hits = task.rate_limit_hits, ?delay, "Rate limited; backing off");

        if let Err(e) = self.agent.pause(task_id).await {
            debug!(task_id, error = %e, "Agent session already stopped");
        }
        self.machine
            .transition(task_id, Trigger::BackoffPause, None)
            .await?;
        self.schedule_limit_clear(task_id, delay);
        Ok(())
    }

    fn schedule_limit_clear(&self, task_id: TaskId, delay: Duration) {
        let signals = self.signals.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(AgentSignal::RateLimitCleared { task_id }).await;
        });
        self.set_backoff(task_id, Some(handle.abort_handle()));
    }

    async fn limit_cleared(&self, task_id: TaskId) -> RunnerResult<Task> {
        let task = self
            .machine
            .transition(task_id, Trigger::LimitCleared, None)
            .await?;
        self.set_backoff(task_id, None);
        self.rate_limited.store(false, Ordering::Release);
        info!(task_id, "Rate limit cleared; resuming");
        self.resume_session(task).await
    }

    async fn resume_session(&self, task: Task) -> RunnerResult<Task> {
        let task_id = task.id;
        let reuse = task.session_mode == SessionMode::Persist;
        if let Err(e) = self.agent.resume(SessionRequest::for_task(&task, reuse)).await {
            warn!(task_id, error = %e, "Agent failed to resume task");
            self.machine
                .transition(
                    task_id,
                    Trigger::Interrupt,
                    Some(format!("Failed to resume agent: {e:#}")),
                )
                .await?;
            return self.recover(task_id).await;
        }
        Ok(task)
    }

    /// Drive an INTERRUPTED task back to RUNNING or to FAILED.
    async fn recover(&self, task_id: TaskId) -> RunnerResult<Task> {
        let policy = &self.policy;
        loop {
            let (task, (action, attempt)) = self
                .machine
                .update_with(task_id, |task| {
                    let action = policy.decide_interruption(task);
                    let attempt = policy.begin(task, action);
                    if action == RecoveryAction::Skip {
                        policy.settle(task, attempt, RecoveryResult::Success, None);
                    }
                    Ok((action, attempt))
                })
                .await?;

            if action == RecoveryAction::Skip {
                let reason = policy.exhausted_reason(&task);
                warn!(task_id, attempt, %reason, "Giving up on task");
                let failed = self
                    .machine
                    .transition(task_id, Trigger::GiveUp, Some(reason))
                    .await?;
                self.finish(task_id);
                return Ok(failed);
            }

            if action == RecoveryAction::RestartSession {
                if let Err(e) = self.agent.discard_session(task_id).await {
                    warn!(task_id, error = %e, "Failed to discard agent session");
                }
            }
            let reuse = action == RecoveryAction::Retry && task.session_mode == SessionMode::Persist;
            info!(task_id, attempt, ?action, reuse, "Recovering task");

            match self.agent.start(SessionRequest::for_task(&task, reuse)).await {
                Ok(()) => {
                    self.machine
                        .update_with(task_id, |task| {
                            Ok(policy.settle(task, attempt, RecoveryResult::Success, None))
                        })
                        .await?;
                    return self
                        .machine
                        .transition(task_id, Trigger::Recover, None)
                        .await;
                }
                Err(e) => {
                    warn!(task_id, attempt, error = %e, "Recovery attempt failed");
                    let error = format!("{e:#}");
                    self.machine
                        .update_with(task_id, |task| {
                            Ok(policy.settle(task, attempt, RecoveryResult::Failed, Some(error)))
                        })
                        .await?;
                }
            }
        }
    }

    /// Take ownership of a task found active at startup.
    pub async fn adopt(&self, task: &Task) -> RunnerResult<()> {
        let task_id = task.id;
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Idle) {
                warn!(task_id, status = %task.status, "Another task already holds the slot");
                return Err(RunnerError::RunnerBusy {
                    active: self.active_task_locked(&slot),
                });
            }
            *slot = Slot::Active(ActiveTask {
                task_id,
                backoff: None,
            });
        }
        info!(task_id, status = %task.status, "Adopting active task");

        let _gate = self.gate.lock().await;
        match task.status {
            TaskStatus::Running => {
                self.machine
                    .transition(
                        task_id,
                        Trigger::Interrupt,
                        Some("Runner restarted while the task was running".to_string()),
                    )
                    .await?;
                self.recover(task_id).await?;
            }
            // Stopped between an interruption and its recovery attempt.
            TaskStatus::Interrupted => {
                self.recover(task_id).await?;
            }
            TaskStatus::RateLimited => {
                self.rate_limited.store(true, Ordering::Release);
                self.machine
                    .transition(task_id, Trigger::BackoffPause, None)
                    .await?;
                self.schedule_limit_clear(task_id, self.policy.backoff_delay(task.rate_limit_hits, None));
            }
            TaskStatus::PausedByLimit => {
                self.rate_limited.store(true, Ordering::Release);
                self.schedule_limit_clear(task_id, self.policy.backoff_delay(task.rate_limit_hits, None));
            }
            // The previous agent process is gone with the previous runner.
            TaskStatus::Cancelling => {
                self.machine
                    .transition(task_id, Trigger::CancelConfirmed, None)
                    .await?;
                self.finish(task_id);
            }
            TaskStatus::Terminating => {
                self.machine
                    .transition(task_id, Trigger::ForceStopped, None)
                    .await?;
                self.finish(task_id);
            }
            _ => {}
        }
        Ok(())
    }

    fn active_task_locked(&self, slot: &Slot) -> Option<TaskId> {
        match slot {
            Slot::Active(active) => Some(active.task_id),
            Slot::Idle | Slot::Reserved => None,
        }
    }
}

impl SnapshotSource for RunnerSupervisor {
    fn system_state(&self) -> SystemState {
        let (busy, active) = {
            let slot = self.slot.lock();
            (!matches!(*slot, Slot::Idle), self.active_task_locked(&slot))
        };
        let running_tasks = active
            .and_then(|id| match self.machine.store().find_by_id(id) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = id, error = %e, "Failed to load active task for snapshot");
                    None
                }
            })
            .map(|task| vec![task.summary()])
            .unwrap_or_default();

        SystemState {
            connected: self.is_connected(),
            rate_limited: self.is_rate_limited(),
            runner_status: if busy {
                RunnerStatus::Busy
            } else {
                RunnerStatus::Idle
            },
            running_tasks,
            queued_count: self.queue.len(),
            timestamp: now_ms(),
        }
    }
}
