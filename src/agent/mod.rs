//! Port to the external coding agent.
//!
//! Commands go out through [`Agent`]; everything the agent reports comes back
//! asynchronously as [`AgentSignal`]s on a bounded channel that the runner
//! supervisor drains.

mod process;

pub use process::CommandAgent;

use crate::types::{Task, TaskId};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// What the agent reports about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    Log {
        task_id: TaskId,
        line: String,
        is_error: bool,
    },
    Completed {
        task_id: TaskId,
    },
    Failed {
        task_id: TaskId,
        reason: String,
    },
    RateLimited {
        task_id: TaskId,
        retry_after: Option<Duration>,
    },
    /// The limit was lifted, either by the backoff timer or externally.
    RateLimitCleared {
        task_id: TaskId,
    },
    /// The session went away without completing or failing.
    Exited {
        task_id: TaskId,
        reason: String,
    },
    CancelAcknowledged {
        task_id: TaskId,
    },
    Connected,
    Disconnected {
        reason: Option<String>,
    },
}

impl AgentSignal {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Log { task_id, .. }
            | Self::Completed { task_id }
            | Self::Failed { task_id, .. }
            | Self::RateLimited { task_id, .. }
            | Self::RateLimitCleared { task_id }
            | Self::Exited { task_id, .. }
            | Self::CancelAcknowledged { task_id } => Some(*task_id),
            Self::Connected | Self::Disconnected { .. } => None,
        }
    }
}

pub type SignalSender = mpsc::Sender<AgentSignal>;
pub type SignalReceiver = mpsc::Receiver<AgentSignal>;

pub fn signal_channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Everything the agent needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub task_id: TaskId,
    pub instruction: String,
    pub script_content: Option<String>,
    pub base_branch: Option<String>,
    pub current_branch: Option<String>,
    pub ticket_key: Option<String>,
    pub skip_permissions: bool,
    /// Continue the context previously created for this task instead of
    /// starting a fresh one.
    pub reuse_session: bool,
}

impl SessionRequest {
    pub fn for_task(task: &Task, reuse_session: bool) -> Self {
        Self {
            task_id: task.id,
            instruction: task.instruction.clone(),
            script_content: task.script_content.clone(),
            base_branch: task.base_branch.clone(),
            current_branch: task.current_branch.clone(),
            ticket_key: task.ticket_key.clone(),
            skip_permissions: task.skip_permissions,
            reuse_session,
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Establish connectivity. Reported back as [`AgentSignal::Connected`].
    async fn connect(&self) -> Result<()>;

    /// Begin executing a task.
    async fn start(&self, request: SessionRequest) -> Result<()>;

    /// Suspend the task's session. Fails if nothing is running for it.
    async fn pause(&self, task_id: TaskId) -> Result<()>;

    /// Continue a paused or rate-limited task.
    async fn resume(&self, request: SessionRequest) -> Result<()>;

    /// Ask the session to stop gracefully. The acknowledgement arrives later
    /// as [`AgentSignal::CancelAcknowledged`].
    async fn cancel(&self, task_id: TaskId) -> Result<()>;

    /// Force the session to stop. Returns once it is gone.
    async fn kill(&self, task_id: TaskId) -> Result<()>;

    /// Forget any context kept for the task.
    async fn discard_session(&self, task_id: TaskId) -> Result<()>;
}
