//! The task store: in-memory view of all tasks in front of a backend.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, watch};

use super::{InMemoryStorage, Storage, StorageError};
use crate::core::task::{LastResult, Task, TaskDraft, ValidationError};
use crate::core::types::TaskId;

/// Errors returned by task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Owner of all task records.
///
/// Every mutation is written to the backend before it becomes visible in
/// memory; if the write fails the in-memory map is left as it was.
pub struct TaskStore {
    storage: Arc<dyn Storage>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    changes: watch::Sender<u64>,
}

impl TaskStore {
    /// Load every valid record from `storage`.
    ///
    /// Records left in the running state by a previous process are rewritten
    /// as interrupted.
    pub async fn open(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let loaded = storage.load().await?;
        if loaded.skipped > 0 {
            tracing::warn!(skipped = loaded.skipped, "some task records could not be loaded");
        }

        let mut tasks = HashMap::with_capacity(loaded.tasks.len());
        for mut task in loaded.tasks {
            if task.is_running() {
                task.last_result = Some(LastResult::Interrupted);
                if let Err(e) = storage.upsert(&task).await {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to persist interrupted state");
                }
                tracing::info!(task_id = %task.id, "marked stale run as interrupted");
            }
            tasks.insert(task.id.clone(), task);
        }

        tracing::info!(count = tasks.len(), "task store loaded");

        let (changes, _) = watch::channel(0);
        Ok(Self {
            storage,
            tasks: RwLock::new(tasks),
            changes,
        })
    }

    /// An empty store that keeps nothing across restarts.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::open(Arc::new(InMemoryStorage::new())).await
    }

    /// Observe mutations. The value is a generation counter bumped after
    /// every successful change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<_> = tasks.values().cloned().collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Validate the draft, assign a fresh id and persist the new task.
    pub async fn create(&self, draft: TaskDraft) -> Result<Task, StoreError> {
        let task = Task::from_draft(TaskId::generate(), draft, Utc::now())?;

        let mut tasks = self.tasks.write().await;
        self.storage.upsert(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        drop(tasks);

        tracing::info!(task_id = %task.id, name = %task.name, "task created");
        self.notify();
        Ok(task)
    }

    /// Replace a task's editable fields. Run bookkeeping is preserved.
    pub async fn update(&self, id: &TaskId, draft: TaskDraft) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut task = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        task.apply_draft(draft, Utc::now())?;
        self.storage.upsert(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        drop(tasks);

        tracing::info!(task_id = %task.id, "task updated");
        self.notify();
        Ok(task)
    }

    pub async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(id) {
            return Err(StoreError::NotFound(id.clone()));
        }

        self.storage.remove(id).await?;
        tasks.remove(id);
        drop(tasks);

        tracing::info!(task_id = %id, "task deleted");
        self.notify();
        Ok(())
    }

    /// Record that a run started at `at`.
    pub async fn mark_started(&self, id: &TaskId, at: DateTime<Utc>) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut task = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        task.last_run_at = Some(at);
        task.last_result = Some(LastResult::Running);
        self.storage.upsert(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        drop(tasks);

        self.notify();
        Ok(task)
    }

    /// Store a run's terminal result if the task still exists.
    ///
    /// Returns `Ok(false)` when the task was deleted in the meantime. The
    /// in-memory record is updated even if persisting fails, since the run
    /// has ended regardless; the storage error is still returned.
    pub async fn record_result(&self, id: &TaskId, result: LastResult) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(false);
        };

        task.last_result = Some(result);
        let snapshot = task.clone();
        let persisted = self.storage.upsert(&snapshot).await;
        drop(tasks);

        self.notify();
        persisted?;
        Ok(true)
    }
}
