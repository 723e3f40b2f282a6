//! Append-only execution log chunks.

use super::{Database, now_ms};
use crate::types::{ExecutionLog, TaskId};
use anyhow::Result;
use rusqlite::{Row, params};

fn parse_log_row(row: &Row) -> rusqlite::Result<ExecutionLog> {
    Ok(ExecutionLog {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        chunk: row.get("chunk")?,
        is_error: row.get("is_error")?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    pub fn append_log_chunk(&self, task_id: TaskId, chunk: &str, is_error: bool) -> Result<ExecutionLog> {
        let created_at = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO execution_logs (task_id, chunk, is_error, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, chunk, is_error, created_at],
            )?;
            Ok(ExecutionLog {
                id: conn.last_insert_rowid(),
                task_id,
                chunk: chunk.to_string(),
                is_error,
                created_at,
            })
        })
    }

    /// Chunks in append order. `after_id` resumes a previous read; `limit`
    /// caps the page.
    pub fn get_logs(
        &self,
        task_id: TaskId,
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionLog>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, chunk, is_error, created_at FROM execution_logs
                 WHERE task_id = ?1 AND id > ?2
                 ORDER BY id ASC
                 LIMIT ?3",
            )?;
            let logs = stmt
                .query_map(params![task_id, after_id.unwrap_or(0), limit], parse_log_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(logs)
        })
    }
}
