//! Task rows.

use super::history::record_status_change;
use super::{Database, now_ms};
use crate::types::{NewTask, PRIORITY_DEFAULT, RecoveryAttempt, Task, TaskId, TaskStatus};
use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

const TASK_COLUMNS: &str = "id, instruction, script_content, base_branch, current_branch, \
     ticket_key, skip_permissions, session_mode, execution_mode, status, priority, \
     failure_reason, retry_count, rate_limit_hits, recovery_history, created_at, started_at, \
     completed_at, updated_at, archived, deleted_at";

/// Convert a text column into an enum, surfacing bad values as conversion errors.
fn parse_column<T: std::str::FromStr<Err = String>>(
    row: &Row,
    idx: &str,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            anyhow!("{idx}: {e}").into(),
        )
    })
}

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let history_json: String = row.get("recovery_history")?;
    let recovery_history: Vec<RecoveryAttempt> =
        serde_json::from_str(&history_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?;

    Ok(Task {
        id: row.get("id")?,
        instruction: row.get("instruction")?,
        script_content: row.get("script_content")?,
        base_branch: row.get("base_branch")?,
        current_branch: row.get("current_branch")?,
        ticket_key: row.get("ticket_key")?,
        skip_permissions: row.get("skip_permissions")?,
        session_mode: parse_column(row, "session_mode")?,
        execution_mode: parse_column(row, "execution_mode")?,
        status: parse_column(row, "status")?,
        priority: row.get("priority")?,
        queue_position: None,
        failure_reason: row.get("failure_reason")?,
        retry_count: row.get("retry_count")?,
        rate_limit_hits: row.get("rate_limit_hits")?,
        recovery_history,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        updated_at: row.get("updated_at")?,
        archived: row.get("archived")?,
        deleted_at: row.get("deleted_at")?,
    })
}

impl Database {
    /// Insert a submitted task with its initial status.
    pub fn insert_task(&self, new: &NewTask, status: TaskStatus) -> Result<Task> {
        let now = now_ms();
        let id = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO tasks (instruction, script_content, base_branch, current_branch,
                    ticket_key, skip_permissions, session_mode, execution_mode, status, priority,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    new.instruction,
                    new.script_content,
                    new.base_branch,
                    new.current_branch,
                    new.ticket_key,
                    new.skip_permissions,
                    new.session_mode.as_str(),
                    new.execution_mode.as_str(),
                    status.as_str(),
                    new.priority.unwrap_or(PRIORITY_DEFAULT),
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid();
            record_status_change(&tx, id, status, None)?;
            tx.commit()?;
            Ok(id)
        })?;

        self.get_task(id)?
            .ok_or_else(|| anyhow!("Task {id} vanished after insert"))
    }

    /// Write back every mutable field. A status change is appended to the
    /// task's status history in the same transaction.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let history = serde_json::to_string(&task.recovery_history)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT status FROM tasks WHERE id = ?1",
                    params![task.id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(previous) = previous else {
                return Err(anyhow!("Task not found: {}", task.id));
            };

            tx.execute(
                "UPDATE tasks SET status = ?1, priority = ?2, failure_reason = ?3,
                    retry_count = ?4, rate_limit_hits = ?5, recovery_history = ?6,
                    started_at = ?7, completed_at = ?8, updated_at = ?9, archived = ?10,
                    deleted_at = ?11, current_branch = ?12
                 WHERE id = ?13",
                params![
                    task.status.as_str(),
                    task.priority,
                    task.failure_reason,
                    task.retry_count,
                    task.rate_limit_hits,
                    history,
                    task.started_at,
                    task.completed_at,
                    task.updated_at,
                    task.archived,
                    task.deleted_at,
                    task.current_branch,
                    task.id,
                ],
            )?;

            if previous != task.status.as_str() {
                let reason = matches!(
                    task.status,
                    TaskStatus::Interrupted | TaskStatus::Failed | TaskStatus::Killed
                )
                .then_some(task.failure_reason.as_deref())
                .flatten();
                record_status_change(&tx, task.id, task.status, reason)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    params![id],
                    parse_task_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    /// Live tasks in any of `statuses`, in run order.
    pub fn list_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE deleted_at IS NULL AND status IN ({placeholders})
             ORDER BY priority ASC, created_at ASC, id ASC"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    pub fn list_tasks_ordered(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE deleted_at IS NULL
                 ORDER BY priority ASC, created_at ASC, id ASC"
            ))?;
            let tasks = stmt
                .query_map([], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }
}
