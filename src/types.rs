//! Core types for the agent runner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned task identifier (monotonic).
pub type TaskId = i64;

/// Task priority. Lower numbers run first.
pub type Priority = i32;

/// Default priority for submissions that do not specify one.
pub const PRIORITY_DEFAULT: Priority = 5;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Paused,
    PausedByLimit,
    RateLimited,
    Interrupted,
    Cancelling,
    Cancelled,
    Terminating,
    Killed,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 13] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Paused,
        Self::PausedByLimit,
        Self::RateLimited,
        Self::Interrupted,
        Self::Cancelling,
        Self::Cancelled,
        Self::Terminating,
        Self::Killed,
        Self::Completed,
        Self::Failed,
    ];

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Killed
        )
    }

    /// Statuses that occupy the single execution slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Running
                | Self::Paused
                | Self::PausedByLimit
                | Self::RateLimited
                | Self::Cancelling
                | Self::Terminating
        )
    }

    /// Not started yet.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::PausedByLimit => "PAUSED_BY_LIMIT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Interrupted => "INTERRUPTED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Terminating => "TERMINATING",
            Self::Killed => "KILLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid task status: {s}"))
    }
}

/// Whether an agent context is created per run or reused across runs of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionMode {
    #[default]
    New,
    Persist,
}

/// How a submitted task reaches the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Ordered by the queue manager.
    #[default]
    Queued,
    /// Handed straight to the runner; rejected when it is busy.
    Direct,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!(concat!("Invalid ", stringify!($ty), ": {}"), s)),
                }
            }
        }
    };
}

string_enum!(SessionMode { New => "NEW", Persist => "PERSIST" });
string_enum!(ExecutionMode { Queued => "QUEUED", Direct => "DIRECT" });

/// Action chosen by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    /// Re-issue the instruction in the existing session.
    Retry,
    /// Give up; the task fails.
    Skip,
    /// Discard the session and start fresh.
    RestartSession,
}

impl RecoveryAction {
    /// Retry and restart consume the retry budget; skip does not.
    pub fn consumes_retry(&self) -> bool {
        matches!(self, Self::Retry | Self::RestartSession)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryResult {
    Success,
    Failed,
}

/// One recovery attempt in a task's audit trail.
///
/// `result` stays `None` while the action is in flight and is written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub attempt: u32,
    pub timestamp: i64,
    pub action: RecoveryAction,
    pub result: Option<RecoveryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A queued or executed instruction for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub instruction: String,
    pub script_content: Option<String>,
    pub base_branch: Option<String>,
    pub current_branch: Option<String>,
    pub ticket_key: Option<String>,
    pub skip_permissions: bool,
    pub session_mode: SessionMode,
    pub execution_mode: ExecutionMode,

    pub status: TaskStatus,
    pub priority: Priority,
    /// Derived from the queue manager; never persisted.
    #[serde(default)]
    pub queue_position: Option<usize>,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub rate_limit_hits: u32,
    pub recovery_history: Vec<RecoveryAttempt>,

    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub archived: bool,
    pub deleted_at: Option<i64>,
}

impl Task {
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            status: self.status,
            instruction: summarize(&self.instruction, SUMMARY_LIMIT),
            priority: self.priority,
            started_at: self.started_at,
        }
    }

    /// True once the task has been handed to the agent at least once.
    pub fn has_run(&self) -> bool {
        self.started_at.is_some()
    }
}

const SUMMARY_LIMIT: usize = 120;

fn summarize(text: &str, limit: usize) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= limit {
        return line.to_string();
    }
    let cut: String = line.chars().take(limit.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Lightweight view of a running task for system snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub instruction: String,
    pub priority: Priority,
    pub started_at: Option<i64>,
}

/// Submission payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub instruction: String,
    #[serde(default)]
    pub script_content: Option<String>,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default)]
    pub session_mode: SessionMode,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub ticket_key: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub current_branch: Option<String>,
}

impl NewTask {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_session_mode(mut self, mode: SessionMode) -> Self {
        self.session_mode = mode;
        self
    }
}

/// Append-only output chunk attributed to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub task_id: TaskId,
    pub chunk: String,
    pub is_error: bool,
    pub created_at: i64,
}

/// One persisted status and how long the task stayed in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub reason: Option<String>,
    pub timestamp: i64,
    pub end_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    Idle,
    Busy,
}

/// Point-in-time view handed to reattaching observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub connected: bool,
    pub rate_limited: bool,
    pub runner_status: RunnerStatus,
    pub running_tasks: Vec<TaskSummary>,
    pub queued_count: usize,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_and_terminal_sets_are_disjoint() {
        for status in TaskStatus::ALL {
            assert!(!(status.is_active() && status.is_terminal()), "{status}");
        }
        let active: Vec<_> = TaskStatus::ALL.iter().filter(|s| s.is_active()).collect();
        assert_eq!(active.len(), 6);
        assert!(!TaskStatus::Interrupted.is_active());
        assert!(!TaskStatus::Interrupted.is_terminal());
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(TaskStatus::PausedByLimit.to_string(), "PAUSED_BY_LIMIT");
        assert_eq!(
            "rate_limited".parse::<TaskStatus>().unwrap(),
            TaskStatus::RateLimited
        );
        assert!("sleeping".parse::<TaskStatus>().is_err());

        let json = serde_json::to_string(&TaskStatus::PausedByLimit).unwrap();
        assert_eq!(json, "\"PAUSED_BY_LIMIT\"");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("persist".parse::<SessionMode>().unwrap(), SessionMode::Persist);
        assert_eq!("DIRECT".parse::<ExecutionMode>().unwrap(), ExecutionMode::Direct);
        assert!("later".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_summary_truncates_first_line() {
        let long = "x".repeat(300);
        assert_eq!(summarize(&long, 10), "xxxxxxx...");
        assert_eq!(summarize("fix the bug\nmore detail", 50), "fix the bug");
    }
}
