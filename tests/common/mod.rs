//! Shared fixtures for engine integration tests: a scripted agent double and
//! helpers to run an engine against an in-memory database.

#![allow(dead_code)]

use agent_runner::agent::{Agent, AgentSignal, SessionRequest, SignalSender, signal_channel};
use agent_runner::config::{BackoffStrategy, Config};
use agent_runner::db::Database;
use agent_runner::engine::{Engine, EngineHandle};
use agent_runner::store::TaskStore;
use agent_runner::types::{ExecutionLog, NewTask, StatusChange, Task, TaskId, TaskStatus};
use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One command the engine sent to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Connect,
    Start { task_id: TaskId, reuse: bool },
    Pause(TaskId),
    Resume { task_id: TaskId, reuse: bool },
    Cancel(TaskId),
    Kill(TaskId),
    Discard(TaskId),
}

/// Agent double. Records every call; behavior is toggled per test.
pub struct ScriptedAgent {
    signals: SignalSender,
    calls: Mutex<Vec<AgentCall>>,
    /// Number of upcoming `start` calls that fail.
    fail_starts: AtomicUsize,
    /// Acknowledge cancel requests immediately.
    ack_cancel: AtomicBool,
    /// Delay before an enabled cancel acknowledgement is sent.
    ack_delay: Mutex<Option<Duration>>,
    fail_kill: AtomicBool,
}

impl ScriptedAgent {
    pub fn new(signals: SignalSender) -> Self {
        Self {
            signals,
            calls: Mutex::new(Vec::new()),
            fail_starts: AtomicUsize::new(0),
            ack_cancel: AtomicBool::new(true),
            ack_delay: Mutex::new(None),
            fail_kill: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    pub fn starts(&self) -> Vec<TaskId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::Start { task_id, .. } => Some(task_id),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next_starts(&self, n: usize) {
        self.fail_starts.store(n, Ordering::SeqCst);
    }

    pub fn set_ack_cancel(&self, ack: bool) {
        self.ack_cancel.store(ack, Ordering::SeqCst);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock() = Some(delay);
    }

    pub fn set_fail_kill(&self, fail: bool) {
        self.fail_kill.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: AgentCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn connect(&self) -> Result<()> {
        self.record(AgentCall::Connect);
        self.signals.send(AgentSignal::Connected).await?;
        Ok(())
    }

    async fn start(&self, request: SessionRequest) -> Result<()> {
        self.record(AgentCall::Start {
            task_id: request.task_id,
            reuse: request.reuse_session,
        });
        let failing = self
            .fail_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("agent refused to start");
        }
        Ok(())
    }

    async fn pause(&self, task_id: TaskId) -> Result<()> {
        self.record(AgentCall::Pause(task_id));
        Ok(())
    }

    async fn resume(&self, request: SessionRequest) -> Result<()> {
        self.record(AgentCall::Resume {
            task_id: request.task_id,
            reuse: request.reuse_session,
        });
        Ok(())
    }

    async fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.record(AgentCall::Cancel(task_id));
        if !self.ack_cancel.load(Ordering::SeqCst) {
            return Ok(());
        }
        let delay = *self.ack_delay.lock();
        match delay {
            Some(delay) => {
                let signals = self.signals.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = signals.send(AgentSignal::CancelAcknowledged { task_id }).await;
                });
            }
            None => {
                self.signals
                    .send(AgentSignal::CancelAcknowledged { task_id })
                    .await?;
            }
        }
        Ok(())
    }

    async fn kill(&self, task_id: TaskId) -> Result<()> {
        self.record(AgentCall::Kill(task_id));
        if self.fail_kill.load(Ordering::SeqCst) {
            bail!("process would not die");
        }
        Ok(())
    }

    async fn discard_session(&self, task_id: TaskId) -> Result<()> {
        self.record(AgentCall::Discard(task_id));
        Ok(())
    }
}

/// SQLite store whose next `n` writes of a RUNNING status fail.
pub struct FlakyStore {
    inner: Arc<Database>,
    failing_running_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<Database>) -> Self {
        Self {
            inner,
            failing_running_writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_running_writes(&self, n: usize) {
        self.failing_running_writes.store(n, Ordering::SeqCst);
    }

    pub fn pending_failures(&self) -> usize {
        self.failing_running_writes.load(Ordering::SeqCst)
    }
}

impl TaskStore for FlakyStore {
    fn create(&self, new: &NewTask, status: TaskStatus) -> Result<Task> {
        TaskStore::create(&*self.inner, new, status)
    }

    fn update(&self, task: &Task) -> Result<()> {
        if task.status == TaskStatus::Running
            && self
                .failing_running_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            bail!("disk I/O error");
        }
        TaskStore::update(&*self.inner, task)
    }

    fn find_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        TaskStore::find_by_id(&*self.inner, id)
    }

    fn find_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        TaskStore::find_by_status(&*self.inner, statuses)
    }

    fn find_all_ordered_by_priority_then_created_at(&self) -> Result<Vec<Task>> {
        TaskStore::find_all_ordered_by_priority_then_created_at(&*self.inner)
    }

    fn append_log(&self, task_id: TaskId, chunk: &str, is_error: bool) -> Result<ExecutionLog> {
        TaskStore::append_log(&*self.inner, task_id, chunk, is_error)
    }

    fn find_logs(
        &self,
        task_id: TaskId,
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionLog>> {
        TaskStore::find_logs(&*self.inner, task_id, after_id, limit)
    }

    fn status_history(&self, task_id: TaskId) -> Result<Vec<StatusChange>> {
        TaskStore::status_history(&*self.inner, task_id)
    }
}

/// Config tuned for fast tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.runner.cancel_timeout_ms = 300;
    config.runner.kill_timeout_ms = 300;
    config.runner.poll_interval_ms = 20;
    config.recovery.max_retries = 3;
    config.recovery.restart_after_retries = 0;
    config.recovery.backoff.strategy = BackoffStrategy::Fixed;
    config.recovery.backoff.fixed_delay_ms = 50;
    config
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub agent: Arc<ScriptedAgent>,
    pub db: Arc<Database>,
    /// Injects signals as if the agent had sent them.
    pub signals: SignalSender,
    handle: Option<EngineHandle>,
}

impl Harness {
    pub async fn start(config: Config) -> Self {
        let db = Arc::new(Database::open_in_memory().expect("Failed to create in-memory database"));
        Self::start_with_db(config, db).await
    }

    pub async fn start_with_db(config: Config, db: Arc<Database>) -> Self {
        let store: Arc<dyn TaskStore> = db.clone();
        Self::start_with_store(config, db, store).await
    }

    /// Run against `store`; `db` is the database underneath it.
    pub async fn start_with_store(
        config: Config,
        db: Arc<Database>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        let (tx, rx) = signal_channel(config.runner.signal_capacity);
        let agent = Arc::new(ScriptedAgent::new(tx.clone()));
        let engine = Engine::new(&config, store, agent.clone(), (tx.clone(), rx));
        let handle = engine.start().await.expect("engine failed to start");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !engine.supervisor().is_connected() {
            assert!(tokio::time::Instant::now() < deadline, "agent never connected");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Self {
            engine,
            agent,
            db,
            signals: tx,
            handle: Some(handle),
        }
    }

    pub async fn signal(&self, signal: AgentSignal) {
        self.signals.send(signal).await.expect("signal channel closed");
    }

    pub async fn wait_until(&self, task_id: TaskId, check: impl Fn(&Task) -> bool) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.engine.task(task_id).expect("task missing");
            if check(&task) {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task {task_id} never reached the expected state: {task:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_status(&self, task_id: TaskId, status: TaskStatus) -> Task {
        self.wait_until(task_id, |task| task.status == status).await
    }

    /// Every live task row that occupies the execution slot.
    pub fn active_rows(&self) -> Vec<Task> {
        TaskStore::find_all_ordered_by_priority_then_created_at(&*self.db)
            .expect("list tasks")
            .into_iter()
            .filter(|task| task.status.is_active())
            .collect()
    }

    pub async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.engine.supervisor().is_idle() {
            if tokio::time::Instant::now() > deadline {
                panic!("runner never became idle");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}
