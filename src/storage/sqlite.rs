//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{LoadedTasks, Storage, StorageError, retain_valid};
use crate::core::task::{LastResult, Task};
use crate::core::types::TaskId;

type TaskRow = (
    String,
    String,
    Option<String>,
    String,
    bool,
    Option<String>,
    Option<String>,
    String,
    String,
);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn time_to_string(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn string_to_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", s, e))
}

fn row_to_task(row: TaskRow) -> Result<Task, String> {
    let (id, name, schedule, command, enabled, last_run_at, last_result, created_at, updated_at) =
        row;

    let last_result = last_result
        .map(|json| serde_json::from_str::<LastResult>(&json))
        .transpose()
        .map_err(|e| format!("bad last_result: {}", e))?;

    Ok(Task {
        id: TaskId::new(id),
        name,
        schedule,
        command,
        enabled,
        last_run_at: last_run_at.as_deref().map(string_to_time).transpose()?,
        last_result,
        created_at: string_to_time(&created_at)?,
        updated_at: string_to_time(&updated_at)?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load(&self) -> Result<LoadedTasks, StorageError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, name, schedule, command, enabled, last_run_at, last_result, created_at, updated_at FROM tasks ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut candidates = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            let id = row.0.clone();
            match row_to_task(row) {
                Ok(task) => candidates.push(task),
                Err(e) => {
                    tracing::warn!(task_id = %id, error = %e, "skipping undecodable task row");
                    skipped += 1;
                }
            }
        }

        Ok(retain_valid(candidates, skipped))
    }

    async fn upsert(&self, task: &Task) -> Result<(), StorageError> {
        let last_result = task
            .last_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, schedule, command, enabled, last_run_at, last_result, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                schedule = excluded.schedule,
                command = excluded.command,
                enabled = excluded.enabled,
                last_run_at = excluded.last_run_at,
                last_result = excluded.last_result,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(task.id.as_str())
        .bind(&task.name)
        .bind(&task.schedule)
        .bind(&task.command)
        .bind(task.enabled)
        .bind(task.last_run_at.as_ref().map(time_to_string))
        .bind(last_result)
        .bind(time_to_string(&task.created_at))
        .bind(time_to_string(&task.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }
}
