//! Status history for auditing how a task moved through its lifecycle.

use super::{Database, now_ms};
use crate::types::{StatusChange, TaskId, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, params};

/// Close the open entry for the task and open one for `status`.
///
/// Snapshot pattern: only the new status is stored; the previous one is the
/// prior row for the same task.
pub(crate) fn record_status_change(
    conn: &Connection,
    task_id: TaskId,
    status: TaskStatus,
    reason: Option<&str>,
) -> Result<()> {
    let now = now_ms();
    conn.execute(
        "UPDATE status_history SET end_timestamp = ?1
         WHERE task_id = ?2 AND end_timestamp IS NULL",
        params![now, task_id],
    )?;
    let end = status.is_terminal().then_some(now);
    conn.execute(
        "INSERT INTO status_history (task_id, status, reason, timestamp, end_timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id, status.as_str(), reason, now, end],
    )?;
    Ok(())
}

impl Database {
    pub fn status_history(&self, task_id: TaskId) -> Result<Vec<StatusChange>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, reason, timestamp, end_timestamp FROM status_history
                 WHERE task_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            })?;
            let mut changes = Vec::new();
            for row in rows {
                let (status, reason, timestamp, end_timestamp) = row?;
                changes.push(StatusChange {
                    status: status.parse().map_err(anyhow::Error::msg)?,
                    reason,
                    timestamp,
                    end_timestamp,
                });
            }
            Ok(changes)
        })
    }
}
