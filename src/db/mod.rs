//! SQLite persistence for tasks and execution logs.

pub mod history;
pub mod logs;
pub mod tasks;

use crate::store::TaskStore;
use crate::types::{ExecutionLog, NewTask, StatusChange, Task, TaskId, TaskStatus};
use anyhow::{Result, anyhow};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Database handle wrapping a SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent access
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.with_conn_mut(|conn| {
            embedded::migrations::runner().run(conn)?;
            Ok(())
        })
    }

    /// Execute a function with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))?;
        f(&conn)
    }

    /// Execute a function with mutable access to the connection (for transactions).
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))?;
        f(&mut conn)
    }
}

impl TaskStore for Database {
    fn create(&self, new: &NewTask, status: TaskStatus) -> Result<Task> {
        self.insert_task(new, status)
    }

    fn update(&self, task: &Task) -> Result<()> {
        self.save_task(task)
    }

    fn find_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        self.get_task(id)
    }

    fn find_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        self.list_tasks_by_status(statuses)
    }

    fn find_all_ordered_by_priority_then_created_at(&self) -> Result<Vec<Task>> {
        self.list_tasks_ordered()
    }

    fn append_log(&self, task_id: TaskId, chunk: &str, is_error: bool) -> Result<ExecutionLog> {
        self.append_log_chunk(task_id, chunk, is_error)
    }

    fn find_logs(
        &self,
        task_id: TaskId,
        after_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionLog>> {
        self.get_logs(task_id, after_id, limit)
    }

    fn status_history(&self, task_id: TaskId) -> Result<Vec<StatusChange>> {
        Database::status_history(self, task_id)
    }
}

/// Get the current timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
