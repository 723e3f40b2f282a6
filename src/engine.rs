//! Runner engine: wires the store, queue, lifecycle, supervisor and agent
//! together and exposes the operator surface.
//!
//! Two background loops run once [`Engine::start`] is called:
//! - the signal loop drains [`AgentSignal`]s into the supervisor;
//! - the scheduler starts the head of the queue whenever the slot is idle.

use crate::agent::{Agent, AgentSignal, SignalReceiver, SignalSender};
use crate::config::Config;
use crate::db::now_ms;
use crate::error::{RunnerError, RunnerResult};
use crate::events::{EventBroadcaster, SnapshotSource, Subscription};
use crate::lifecycle::{LifecycleStateMachine, Trigger};
use crate::queue::QueueManager;
use crate::recovery::RecoveryPolicy;
use crate::store::TaskStore;
use crate::supervisor::{RunnerSupervisor, SupervisorSettings};
use crate::types::{
    ExecutionLog, ExecutionMode, NewTask, Priority, StatusChange, SystemState, Task, TaskId,
    TaskStatus,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Filter for [`Engine::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks in one of these statuses. Empty means any.
    pub statuses: Vec<TaskStatus>,
    pub include_archived: bool,
}

pub struct Engine {
    store: Arc<dyn TaskStore>,
    broadcaster: Arc<EventBroadcaster>,
    machine: Arc<LifecycleStateMachine>,
    queue: Arc<QueueManager>,
    supervisor: Arc<RunnerSupervisor>,
    agent: Arc<dyn Agent>,
    signals: Mutex<Option<SignalReceiver>>,
    poll_interval: Duration,
}

/// Keeps the background loops alive. Dropping it does not stop them; call
/// [`EngineHandle::shutdown`].
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine loop ended abnormally");
            }
        }
        info!("Engine stopped");
    }
}

impl Engine {
    /// Build an engine. `signals` must be the channel the agent reports on.
    pub fn new(
        config: &Config,
        store: Arc<dyn TaskStore>,
        agent: Arc<dyn Agent>,
        signals: (SignalSender, SignalReceiver),
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = signals;
        let broadcaster = Arc::new(EventBroadcaster::new(
            config.events.observer_capacity,
            config.events.backpressure,
        ));
        let queue = Arc::new(QueueManager::new(Arc::clone(&broadcaster)));
        let machine = Arc::new(LifecycleStateMachine::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
        ));
        let supervisor = Arc::new(RunnerSupervisor::new(
            Arc::clone(&machine),
            Arc::clone(&queue),
            Arc::clone(&agent),
            RecoveryPolicy::new(&config.recovery),
            SupervisorSettings::from(&config.runner),
            signal_tx,
        ));
        let source = Arc::downgrade(&supervisor);
        let source: Weak<dyn SnapshotSource> = source;
        broadcaster.set_source(source);

        Arc::new(Self {
            store,
            broadcaster,
            machine,
            queue,
            supervisor,
            agent,
            signals: Mutex::new(Some(signal_rx)),
            poll_interval: config.runner.poll_interval(),
        })
    }

    pub fn supervisor(&self) -> &Arc<RunnerSupervisor> {
        &self.supervisor
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Spawn the signal and scheduler loops, connect the agent and pick up
    /// whatever the previous run left behind.
    pub async fn start(self: &Arc<Self>) -> RunnerResult<EngineHandle> {
        let receiver = self
            .signals
            .lock()
            .take()
            .ok_or_else(|| RunnerError::invalid("engine", "already started"))?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let signal_loop = tokio::spawn(signal_loop(
            Arc::clone(&self.supervisor),
            receiver,
            shutdown_rx.clone(),
        ));

        if let Err(e) = self.agent.connect().await {
            warn!(error = %e, "Agent connection failed");
        }
        self.restore().await?;

        let scheduler = tokio::spawn(scheduler_loop(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.queue),
            self.poll_interval,
            shutdown_rx,
        ));
        info!("Engine started");

        Ok(EngineHandle {
            shutdown,
            tasks: vec![signal_loop, scheduler],
        })
    }

    /// Rebuild in-memory state from the store after a restart.
    async fn restore(&self) -> RunnerResult<()> {
        let tasks = self.store.find_all_ordered_by_priority_then_created_at()?;
        let mut queued = 0;
        for task in tasks {
            match task.status {
                TaskStatus::Queued => {
                    self.queue.enqueue(&task);
                    queued += 1;
                }
                // A direct submission whose caller is gone.
                TaskStatus::Pending => {
                    info!(task_id = task.id, "Cancelling stale direct submission");
                    self.machine.transition(task.id, Trigger::Cancel, None).await?;
                }
                status if status.is_active() || status == TaskStatus::Interrupted => {
                    if let Err(e) = self.supervisor.adopt(&task).await {
                        warn!(task_id = task.id, %status, error = %e, "Could not adopt task");
                    }
                }
                _ => {}
            }
        }
        if queued > 0 {
            info!(queued, "Restored queue");
        }
        Ok(())
    }

    /// Accept a new task. QUEUED tasks wait their turn; DIRECT tasks start
    /// immediately or fail with `RunnerBusy`.
    pub async fn submit(&self, new: NewTask) -> RunnerResult<Task> {
        validate(&new)?;
        match new.execution_mode {
            ExecutionMode::Queued => {
                let mut task = self.store.create(&new, TaskStatus::Queued)?;
                let position = self.queue.enqueue(&task);
                task.queue_position = Some(position);
                info!(task_id = task.id, priority = task.priority, position, "Task queued");
                self.supervisor.idle_notify().notify_one();
                Ok(task)
            }
            ExecutionMode::Direct => {
                let reservation = self.supervisor.try_reserve()?;
                let task = self.store.create(&new, TaskStatus::Pending)?;
                info!(task_id = task.id, "Starting direct task");
                self.supervisor.launch(reservation, task.id).await
            }
        }
    }

    pub async fn cancel(&self, task_id: TaskId) -> RunnerResult<Task> {
        self.supervisor.cancel(task_id).await
    }

    pub async fn kill(&self, task_id: TaskId) -> RunnerResult<Task> {
        self.supervisor.kill(task_id).await
    }

    pub async fn pause(&self) -> RunnerResult<Task> {
        self.supervisor.pause().await
    }

    pub async fn resume(&self) -> RunnerResult<Task> {
        self.supervisor.resume().await
    }

    pub async fn clear_rate_limit(&self) -> RunnerResult<Task> {
        self.supervisor.clear_rate_limit().await
    }

    /// Change the priority of a queued task and move it in the queue.
    pub async fn reprioritize(&self, task_id: TaskId, priority: Priority) -> RunnerResult<Task> {
        let (mut task, _) = self
            .machine
            .update_with(task_id, |task| {
                if task.status != TaskStatus::Queued {
                    return Err(RunnerError::invalid(
                        "priority",
                        format!("task {task_id} is {} and no longer queued", task.status),
                    ));
                }
                task.priority = priority;
                Ok(())
            })
            .await?;
        task.queue_position = self.queue.reprioritize(task_id, priority);
        debug!(task_id, priority, position = ?task.queue_position, "Task reprioritized");
        Ok(task)
    }

    /// Hide a finished task from default listings.
    pub async fn archive(&self, task_id: TaskId) -> RunnerResult<Task> {
        self.finished_update(task_id, "archive", |task| task.archived = true)
            .await
    }

    /// Soft-delete a finished task.
    pub async fn delete(&self, task_id: TaskId) -> RunnerResult<Task> {
        self.finished_update(task_id, "delete", |task| task.deleted_at = Some(now_ms()))
            .await
    }

    async fn finished_update(
        &self,
        task_id: TaskId,
        action: &'static str,
        f: impl FnOnce(&mut Task),
    ) -> RunnerResult<Task> {
        let (task, _) = self
            .machine
            .update_with(task_id, |task| {
                if !task.status.is_terminal() {
                    return Err(RunnerError::invalid(
                        "status",
                        format!("cannot {action} task {task_id} while {}", task.status),
                    ));
                }
                f(task);
                Ok(())
            })
            .await?;
        Ok(task)
    }

    pub fn task(&self, task_id: TaskId) -> RunnerResult<Task> {
        let mut task = self
            .store
            .find_by_id(task_id)?
            .filter(|task| task.deleted_at.is_none())
            .ok_or(RunnerError::TaskNotFound(task_id))?;
        task.queue_position = self.queue.position_of(task_id);
        Ok(task)
    }

    /// Live tasks in run order, with queue positions filled in.
    pub fn list(&self, filter: &TaskFilter) -> RunnerResult<Vec<Task>> {
        let tasks = if filter.statuses.is_empty() {
            self.store.find_all_ordered_by_priority_then_created_at()?
        } else {
            self.store.find_by_status(&filter.statuses)?
        };
        Ok(tasks
            .into_iter()
            .filter(|task| filter.include_archived || !task.archived)
            .map(|mut task| {
                task.queue_position = self.queue.position_of(task.id);
                task
            })
            .collect())
    }

    pub fn logs(
        &self,
        task_id: TaskId,
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> RunnerResult<Vec<ExecutionLog>> {
        self.task(task_id)?;
        Ok(self.store.find_logs(task_id, after_id, limit)?)
    }

    pub fn status_history(&self, task_id: TaskId) -> RunnerResult<Vec<StatusChange>> {
        self.task(task_id)?;
        Ok(self.store.status_history(task_id)?)
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn snapshot(&self) -> SystemState {
        self.broadcaster.snapshot()
    }
}

fn validate(new: &NewTask) -> RunnerResult<()> {
    if new.instruction.trim().is_empty() {
        return Err(RunnerError::invalid("instruction", "must not be empty"));
    }
    if let Some(priority) = new.priority {
        if priority < 0 {
            return Err(RunnerError::invalid("priority", "must not be negative"));
        }
    }
    Ok(())
}

async fn signal_loop(
    supervisor: Arc<RunnerSupervisor>,
    mut receiver: SignalReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            signal = receiver.recv() => {
                let Some(signal) = signal else {
                    debug!("Signal channel closed");
                    break;
                };
                let task_id = signal.task_id();
                let quiet = matches!(signal, AgentSignal::Log { .. });
                if let Err(e) = supervisor.handle_signal(signal).await {
                    if quiet {
                        debug!(?task_id, error = %e, "Failed to record log line");
                    } else {
                        warn!(?task_id, error = %e, "Failed to apply agent signal");
                    }
                }
            }
        }
    }
}

async fn scheduler_loop(
    supervisor: Arc<RunnerSupervisor>,
    queue: Arc<QueueManager>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let idle = supervisor.idle_notify();
    loop {
        while supervisor.is_idle() && !queue.is_empty() {
            match supervisor.start_next().await {
                Ok(task) => info!(task_id = task.id, status = %task.status, "Started queued task"),
                Err(RunnerError::RunnerBusy { .. } | RunnerError::QueueEmpty) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to start queued task");
                    break;
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = idle.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
