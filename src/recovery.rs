//! Recovery policy for interrupted and rate-limited tasks.
//!
//! Interruptions draw from a bounded retry budget and are recorded in the
//! task's recovery history. Rate limits only wait: they are counted in
//! `rate_limit_hits` and never charged to `retry_count`.

use crate::config::{BackoffConfig, BackoffStrategy, RecoveryConfig};
use crate::db::now_ms;
use crate::types::{RecoveryAction, RecoveryAttempt, RecoveryResult, Task};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    max_retries: u32,
    restart_after_retries: u32,
    backoff: BackoffConfig,
}

impl RecoveryPolicy {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            restart_after_retries: config.restart_after_retries,
            backoff: config.backoff.clone(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Choose what to do about an interrupted task.
    pub fn decide_interruption(&self, task: &Task) -> RecoveryAction {
        let action = if task.retry_count >= self.max_retries {
            RecoveryAction::Skip
        } else if self.restart_after_retries > 0
            && consecutive_retries(task) >= self.restart_after_retries
        {
            RecoveryAction::RestartSession
        } else {
            RecoveryAction::Retry
        };
        info!(
            task_id = task.id,
            retry_count = task.retry_count,
            max_retries = self.max_retries,
            ?action,
            "Recovery decision"
        );
        action
    }

    /// Append an in-flight attempt for `action` and charge the retry budget.
    /// Returns the attempt number.
    pub fn begin(&self, task: &mut Task, action: RecoveryAction) -> u32 {
        let attempt = task.recovery_history.len() as u32 + 1;
        task.recovery_history.push(RecoveryAttempt {
            attempt,
            timestamp: now_ms(),
            action,
            result: None,
            error: None,
        });
        if action.consumes_retry() {
            task.retry_count += 1;
        }
        attempt
    }

    /// Record the outcome of an attempt. An attempt that already has a result
    /// is left untouched; returns whether the outcome was written.
    pub fn settle(
        &self,
        task: &mut Task,
        attempt: u32,
        result: RecoveryResult,
        error: Option<String>,
    ) -> bool {
        match task
            .recovery_history
            .iter_mut()
            .find(|a| a.attempt == attempt && a.result.is_none())
        {
            Some(entry) => {
                entry.result = Some(result);
                entry.error = error;
                true
            }
            None => false,
        }
    }

    /// Human-readable reason for a task failed by SKIP.
    pub fn exhausted_reason(&self, task: &Task) -> String {
        let last_error = task
            .recovery_history
            .iter()
            .rev()
            .find_map(|a| a.error.clone())
            .or_else(|| task.failure_reason.clone())
            .unwrap_or_else(|| "agent interrupted".to_string());
        format!(
            "Recovery exhausted after {} retries: {last_error}",
            task.retry_count
        )
    }

    /// Count a rate-limit hit on the task and return how long to wait.
    pub fn register_rate_limit(&self, task: &mut Task, retry_after: Option<Duration>) -> Duration {
        task.rate_limit_hits += 1;
        self.backoff_delay(task.rate_limit_hits, retry_after)
    }

    /// Wait after the task's `hits`-th rate limit.
    ///
    /// `hits` is the task's lifetime count and is not reset by a successful
    /// resume, so under `exponential` a task that keeps running into limits
    /// stays at `max_delay_ms` once it gets there.
    pub fn backoff_delay(&self, hits: u32, retry_after: Option<Duration>) -> Duration {
        let b = &self.backoff;
        match b.strategy {
            BackoffStrategy::Fixed => Duration::from_millis(b.fixed_delay_ms),
            BackoffStrategy::Exponential => {
                let exponent = hits.saturating_sub(1).min(32) as i32;
                let ms = b.initial_delay_ms as f64 * b.multiplier.max(1.0).powi(exponent);
                Duration::from_millis(ms.min(b.max_delay_ms as f64) as u64)
            }
            BackoffStrategy::AgentProvided => {
                retry_after.unwrap_or(Duration::from_millis(b.fixed_delay_ms))
            }
        }
    }
}

/// RETRY attempts since the most recent session restart.
fn consecutive_retries(task: &Task) -> u32 {
    task.recovery_history
        .iter()
        .rev()
        .take_while(|a| a.action == RecoveryAction::Retry)
        .count() as u32
}
