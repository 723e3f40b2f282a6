//! Persistence port consumed by the orchestration core.
//!
//! The core never issues raw queries. Everything durable goes through this
//! trait; [`crate::db::Database`] is the SQLite implementation.

use crate::types::{ExecutionLog, NewTask, StatusChange, Task, TaskId, TaskStatus};
use anyhow::Result;

pub trait TaskStore: Send + Sync {
    /// Persist a new task with the given initial status and return it with its
    /// store-assigned id.
    fn create(&self, new: &NewTask, status: TaskStatus) -> Result<Task>;

    /// Overwrite the mutable fields of an existing task.
    fn update(&self, task: &Task) -> Result<()>;

    fn find_by_id(&self, id: TaskId) -> Result<Option<Task>>;

    fn find_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>>;

    /// All live (not soft-deleted) tasks by `(priority ASC, created_at ASC, id ASC)`.
    fn find_all_ordered_by_priority_then_created_at(&self) -> Result<Vec<Task>>;

    fn append_log(&self, task_id: TaskId, chunk: &str, is_error: bool) -> Result<ExecutionLog>;

    /// Log chunks in append order, optionally only those after `after_id`.
    fn find_logs(
        &self,
        task_id: TaskId,
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionLog>>;

    /// Every status the task has held, oldest first.
    fn status_history(&self, task_id: TaskId) -> Result<Vec<StatusChange>>;
}
