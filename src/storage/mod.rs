//! Storage abstraction for persisting task definitions.
//!
//! Backends implement the [`Storage`] trait (JSON file, SQLite, in-memory).
//! The [`TaskStore`] sits in front of a backend and owns the in-memory map,
//! validation, id assignment and change notification.

mod json;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;

pub use json::JsonFileStorage;
pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
pub use store::{StoreError, TaskStore};

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

use crate::core::task::Task;
use crate::core::types::TaskId;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Reading or writing the backing file failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Result of loading a backend at startup.
#[derive(Debug, Default)]
pub struct LoadedTasks {
    /// Records that decoded and passed validation.
    pub tasks: Vec<Task>,
    /// Number of records dropped as malformed.
    pub skipped: usize,
}

/// Durable home of task records.
///
/// `upsert` and `remove` must be durable when they return `Ok`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read every valid record, skipping malformed ones.
    async fn load(&self) -> Result<LoadedTasks, StorageError>;

    /// Insert or replace a record.
    async fn upsert(&self, task: &Task) -> Result<(), StorageError>;

    /// Delete a record. Removing an absent id is not an error.
    async fn remove(&self, id: &TaskId) -> Result<(), StorageError>;
}

/// Drop records that fail validation or repeat an earlier id.
///
/// `skipped` carries forward any count the backend already accumulated
/// while decoding.
pub(crate) fn retain_valid(candidates: Vec<Task>, skipped: usize) -> LoadedTasks {
    let mut seen = HashSet::new();
    let mut loaded = LoadedTasks {
        tasks: Vec::with_capacity(candidates.len()),
        skipped,
    };

    for task in candidates {
        if let Err(e) = task.validate() {
            tracing::warn!(task_id = %task.id, error = %e, "skipping invalid task record");
            loaded.skipped += 1;
            continue;
        }
        if !seen.insert(task.id.clone()) {
            tracing::warn!(task_id = %task.id, "skipping duplicate task record");
            loaded.skipped += 1;
            continue;
        }
        loaded.tasks.push(task);
    }

    loaded
}
