//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{LoadedTasks, Storage, StorageError, retain_valid};
use crate::core::task::Task;
use crate::core::types::TaskId;

/// In-memory storage backend.
///
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Create a storage pre-populated with records, as if read from disk.
    ///
    /// Records are not validated until `load`.
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    /// Fetch a stored record directly, bypassing any store in front.
    pub fn get(&self, id: &TaskId) -> Result<Task, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.tasks.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn load(&self) -> Result<LoadedTasks, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut candidates: Vec<_> = tasks.values().cloned().collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(retain_valid(candidates, 0))
    }

    async fn upsert(&self, task: &Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        tasks.remove(id);
        Ok(())
    }
}
