//! SQLite persistence: the durable record of tasks and periodic system
//! metrics. This store is the single source of truth for task status; the
//! queue's result cache is a short-TTL convenience layer on top.
//!
//! Writes are last-writer-wins per task id, which is safe because only the
//! owning worker writes a given task's terminal fields.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use crate::core::{SchedulerError, Task, TaskId, TaskPriority, TaskStatus};

/// Durable per-task record as returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Task identifier.
    pub id: TaskId,
    /// Human-readable label.
    pub name: String,
    /// Handler registry key.
    pub function: String,
    /// Priority tier.
    pub priority: TaskPriority,
    /// Last persisted status.
    pub status: TaskStatus,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time the task reached a terminal status, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Identifier of the executing worker, once dequeued.
    pub worker_id: Option<String>,
    /// Handler wall time in seconds.
    pub execution_time: Option<f64>,
    /// Retries consumed.
    pub retry_count: u32,
    /// Last failure message.
    pub error: Option<String>,
    /// Serialized handler result.
    pub result: Option<Value>,
}

/// One periodic system-metrics row.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Global CPU usage in percent.
    pub cpu_percent: f64,
    /// Memory usage in percent.
    pub memory_percent: f64,
    /// Live worker count at snapshot time.
    pub active_workers: usize,
    /// Queue depth at snapshot time.
    pub queue_size: usize,
    /// Recent throughput in tasks per minute.
    pub tasks_per_minute: f64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    function TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    worker_id TEXT,
    execution_time REAL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    result TEXT
);
CREATE TABLE IF NOT EXISTS system_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    cpu_percent REAL,
    memory_percent REAL,
    active_workers INTEGER,
    queue_size INTEGER,
    tasks_per_minute REAL
);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks (created_at);
";

/// Fixed-width UTC timestamp so lexicographic comparison in SQL matches
/// chronological order.
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let raw_id: String = row.get(0)?;
    let id = TaskId::parse(&raw_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
    })?;
    let priority_value: u8 = row.get(3)?;
    let priority = TaskPriority::from_value(priority_value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Integer,
            format!("unknown priority {priority_value}").into(),
        )
    })?;
    let raw_status: String = row.get(4)?;
    let status = TaskStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown status {raw_status}").into(),
        )
    })?;
    let raw_created: String = row.get(5)?;
    let raw_completed: Option<String> = row.get(6)?;
    let raw_result: Option<String> = row.get(11)?;
    let result = raw_result
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

    Ok(TaskRecord {
        id,
        name: row.get(1)?,
        function: row.get(2)?,
        priority,
        status,
        created_at: parse_ts(5, &raw_created)?,
        completed_at: raw_completed
            .as_deref()
            .map(|raw| parse_ts(6, raw))
            .transpose()?,
        worker_id: row.get(7)?,
        execution_time: row.get(8)?,
        retry_count: row.get(9)?,
        error: row.get(10)?,
        result,
    })
}

/// SQLite-backed durable store for tasks and metrics. The connection sits
/// behind a mutex; callers across worker threads and the supervisor share
/// one handle.
pub struct PersistenceStore {
    conn: Mutex<Connection>,
}

impl PersistenceStore {
    /// Open (creating if needed) the database at `path` and apply the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn open(path: &Path) -> Result<Self, SchedulerError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (tests, throwaway runs).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn in_memory() -> Result<Self, SchedulerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SchedulerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace the task's durable record. `completed_at` is
    /// stamped when the status is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] or [`SchedulerError::Codec`]
    /// when the result payload cannot be serialized.
    pub fn upsert_task(&self, task: &Task) -> Result<(), SchedulerError> {
        let completed_at = task.status.is_terminal().then(|| format_ts(Utc::now()));
        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tasks
             (id, name, function, priority, status, created_at, completed_at,
              worker_id, execution_time, retry_count, error, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id.to_string(),
                task.name,
                task.function,
                task.priority.value(),
                task.status.as_str(),
                format_ts(task.created_at),
                completed_at,
                task.worker_id,
                task.execution_time,
                task.retry_count,
                task.error,
                result,
            ],
        )?;
        Ok(())
    }

    /// Read a task's durable record.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, name, function, priority, status, created_at, completed_at,
                        worker_id, execution_time, retry_count, error, result
                 FROM tasks WHERE id = ?1",
                params![id.to_string()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Mark a task cancelled; returns whether a row was updated.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn mark_cancelled(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE tasks SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![
                TaskStatus::Cancelled.as_str(),
                format_ts(Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(updated > 0)
    }

    /// Append a system-metrics row.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn insert_metrics(&self, snapshot: &MetricsSnapshot) -> Result<(), SchedulerError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_metrics
             (timestamp, cpu_percent, memory_percent, active_workers, queue_size, tasks_per_minute)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                format_ts(snapshot.timestamp),
                snapshot.cpu_percent,
                snapshot.memory_percent,
                snapshot.active_workers,
                snapshot.queue_size,
                snapshot.tasks_per_minute,
            ],
        )?;
        Ok(())
    }

    fn window_cutoff(window: Duration) -> String {
        let span = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        format_ts(Utc::now() - span)
    }

    /// Task counts by status over the recent window.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn recent_status_counts(
        &self,
        window: Duration,
    ) -> Result<HashMap<String, u64>, SchedulerError> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(
            "SELECT status, COUNT(*) FROM tasks WHERE created_at >= ?1 GROUP BY status",
        )?;
        let rows = statement.query_map(params![Self::window_cutoff(window)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Average execution time of recently completed tasks, in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn recent_avg_execution_time(&self, window: Duration) -> Result<f64, SchedulerError> {
        let conn = self.conn.lock();
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(execution_time) FROM tasks
             WHERE status = 'completed' AND created_at >= ?1",
            params![Self::window_cutoff(window)],
            |row| row.get(0),
        )?;
        Ok(avg.unwrap_or(0.0))
    }

    /// Number of tasks completed within the recent window; the basis for
    /// throughput.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Storage`] on any SQLite failure.
    pub fn recent_completed_count(&self, window: Duration) -> Result<u64, SchedulerError> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE status = 'completed' AND completed_at >= ?1",
            params![Self::window_cutoff(window)],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
