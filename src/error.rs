//! Error taxonomy for the orchestration core.

use crate::lifecycle::Trigger;
use crate::types::{TaskId, TaskStatus};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    InvalidRequest,
    InvalidTransition,

    // Not found
    TaskNotFound,
    NoActiveTask,

    // Conflict
    RunnerBusy,
    QueueEmpty,

    // Operator-visible faults
    CancelTimedOut,
    KillFailed,
    RecoveryExhausted,

    // Ports
    AgentError,
    StoreError,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid transition for task {task_id}: {trigger} is not allowed from {from}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        trigger: Trigger,
    },

    #[error("No queued tasks")]
    QueueEmpty,

    #[error("Runner is busy{}", busy_with(.active))]
    RunnerBusy { active: Option<TaskId> },

    #[error("Task {task_id} did not acknowledge cancellation within {timeout:?}")]
    CancelTimedOut { task_id: TaskId, timeout: Duration },

    #[error("Failed to kill task {task_id}: {reason}")]
    KillFailed { task_id: TaskId, reason: String },

    #[error("Recovery exhausted for task {task_id} after {attempts} attempts: {last_error}")]
    RecoveryExhausted {
        task_id: TaskId,
        attempts: u32,
        last_error: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("No task is active on the runner")]
    NoActiveTask,

    #[error("Invalid {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Store error: {0:#}")]
    Store(anyhow::Error),
}

fn busy_with(active: &Option<TaskId>) -> String {
    active.map(|id| format!(" with task {id}")).unwrap_or_default()
}

impl RunnerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::QueueEmpty => ErrorCode::QueueEmpty,
            Self::RunnerBusy { .. } => ErrorCode::RunnerBusy,
            Self::CancelTimedOut { .. } => ErrorCode::CancelTimedOut,
            Self::KillFailed { .. } => ErrorCode::KillFailed,
            Self::RecoveryExhausted { .. } => ErrorCode::RecoveryExhausted,
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::NoActiveTask => ErrorCode::NoActiveTask,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::Agent(_) => ErrorCode::AgentError,
            Self::Store(_) => ErrorCode::StoreError,
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field,
            reason: reason.into(),
        }
    }

    pub fn agent(err: impl std::fmt::Display) -> Self {
        Self::Agent(err.to_string())
    }

    /// A failed persistence write aborts the transition that issued it.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<anyhow::Error> for RunnerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RunnerError>() {
            Ok(runner_err) => runner_err,
            Err(err) => RunnerError::Store(err),
        }
    }
}

/// Structured error body for API responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&RunnerError> for ErrorBody {
    fn from(err: &RunnerError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;
