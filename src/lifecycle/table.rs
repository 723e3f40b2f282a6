use crate::types::TaskStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events that request a task status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The runner dequeued the task and started the agent session.
    Start,
    Pause,
    Resume,
    /// The agent reported a rate limit.
    RateLimit,
    /// Recovery scheduled a backoff wait for the rate limit.
    BackoffPause,
    /// Backoff elapsed or the limit was cleared externally.
    LimitCleared,
    /// The agent went away without completing or failing.
    Interrupt,
    /// A retry or session restart brought the task back.
    Recover,
    /// Recovery chose to skip.
    GiveUp,
    Cancel,
    /// The agent acknowledged a cancellation request.
    CancelConfirmed,
    Kill,
    /// The agent process is confirmed stopped after a kill.
    ForceStopped,
    Complete,
    Fail,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::RateLimit => "rate_limit",
            Self::BackoffPause => "backoff_pause",
            Self::LimitCleared => "limit_cleared",
            Self::Interrupt => "interrupt",
            Self::Recover => "recover",
            Self::GiveUp => "give_up",
            Self::Cancel => "cancel",
            Self::CancelConfirmed => "cancel_confirmed",
            Self::Kill => "kill",
            Self::ForceStopped => "force_stopped",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use TaskStatus::*;

/// `(from, trigger) -> to`. Anything not listed is an invalid transition.
pub const TRANSITIONS: &[(TaskStatus, Trigger, TaskStatus)] = &[
    (Pending, Trigger::Start, Running),
    (Queued, Trigger::Start, Running),
    (Running, Trigger::Pause, Paused),
    (Paused, Trigger::Resume, Running),
    (Running, Trigger::RateLimit, RateLimited),
    (RateLimited, Trigger::BackoffPause, PausedByLimit),
    (PausedByLimit, Trigger::LimitCleared, Running),
    (Running, Trigger::Interrupt, Interrupted),
    (Interrupted, Trigger::Recover, Running),
    (Interrupted, Trigger::GiveUp, Failed),
    (Pending, Trigger::Cancel, Cancelled),
    (Queued, Trigger::Cancel, Cancelled),
    (Running, Trigger::Cancel, Cancelling),
    (Paused, Trigger::Cancel, Cancelling),
    (PausedByLimit, Trigger::Cancel, Cancelling),
    (Cancelling, Trigger::CancelConfirmed, Cancelled),
    (Running, Trigger::Kill, Terminating),
    // Escalation of a cancel that was never acknowledged.
    (Cancelling, Trigger::Kill, Terminating),
    (Terminating, Trigger::ForceStopped, Killed),
    (Running, Trigger::Complete, Completed),
    (Running, Trigger::Fail, Failed),
];

/// Destination of `trigger` applied in `from`, if the table allows it.
pub fn next_state(from: TaskStatus, trigger: Trigger) -> Option<TaskStatus> {
    TRANSITIONS
        .iter()
        .find(|(src, t, _)| *src == from && *t == trigger)
        .map(|(_, _, to)| *to)
}

/// Triggers accepted in `from`.
pub fn allowed_triggers(from: TaskStatus) -> Vec<Trigger> {
    TRANSITIONS
        .iter()
        .filter(|(src, _, _)| *src == from)
        .map(|(_, t, _)| *t)
        .collect()
}
