//! JSON file storage implementation.
//!
//! All tasks live in one JSON document, an object keyed by task id. Every
//! write rewrites the whole document to a sibling temp file and renames it
//! over the original, so readers never see a half-written file.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{LoadedTasks, Storage, StorageError, retain_valid};
use crate::core::task::Task;
use crate::core::types::TaskId;

/// File-backed storage holding every task in a single JSON document.
pub struct JsonFileStorage {
    path: PathBuf,
    /// Mirror of the file contents; `None` until first read.
    records: Mutex<Option<BTreeMap<TaskId, Task>>>,
}

impl JsonFileStorage {
    /// Create a storage for the given file. Nothing is read until `load`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn read(&self) -> Result<LoadedTasks, StorageError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "task file missing, starting empty");
                return Ok(LoadedTasks::default());
            }
            Err(e) => return Err(io_error(&self.path, e)),
        };

        let (mut candidates, skipped) = decode_document(&text)
            .map_err(|e| StorageError::SerializationError(format!("{}: {}", self.path.display(), e)))?;
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(retain_valid(candidates, skipped))
    }

    async fn write(&self, records: &BTreeMap<TaskId, Task>) -> Result<(), StorageError> {
        let document: BTreeMap<&str, &Task> = records
            .iter()
            .map(|(id, task)| (id.as_str(), task))
            .collect();
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
        }

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| io_error(&temp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| io_error(&temp, e))?;
        file.sync_all().await.map_err(|e| io_error(&temp, e))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))
    }

    /// Apply `change` to a copy of the records and persist it. The mirror
    /// is only replaced once the write succeeded.
    async fn modify<F>(&self, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<TaskId, Task>),
    {
        let mut guard = self.records.lock().await;
        let mut next = match guard.as_ref() {
            Some(records) => records.clone(),
            None => self
                .read()
                .await?
                .tasks
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
        };

        change(&mut next);
        self.write(&next).await?;
        *guard = Some(next);
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Decode the document into candidate tasks plus a count of undecodable
/// records. Fails only if the document as a whole is unusable.
fn decode_document(text: &str) -> Result<(Vec<Task>, usize), String> {
    if text.trim().is_empty() {
        return Ok((Vec::new(), 0));
    }

    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let mut tasks = Vec::new();
    let mut skipped = 0;

    match value {
        Value::Object(map) => {
            for (key, record) in map {
                match serde_json::from_value::<Task>(record) {
                    Ok(task) if task.id.as_str() == key => tasks.push(task),
                    Ok(task) => {
                        tracing::warn!(key = %key, task_id = %task.id, "skipping task record stored under a different key");
                        skipped += 1;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping undecodable task record");
                        skipped += 1;
                    }
                }
            }
        }
        Value::Array(items) => {
            for (index, record) in items.into_iter().enumerate() {
                match serde_json::from_value::<Task>(record) {
                    Ok(task) => tasks.push(task),
                    Err(e) => {
                        tracing::warn!(index, error = %e, "skipping undecodable task record");
                        skipped += 1;
                    }
                }
            }
        }
        _ => return Err("expected a JSON object or array of tasks".to_string()),
    }

    Ok((tasks, skipped))
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn load(&self) -> Result<LoadedTasks, StorageError> {
        let mut guard = self.records.lock().await;
        let loaded = self.read().await?;
        *guard = Some(
            loaded
                .tasks
                .iter()
                .map(|t| (t.id.clone(), t.clone()))
                .collect(),
        );
        Ok(loaded)
    }

    async fn upsert(&self, task: &Task) -> Result<(), StorageError> {
        self.modify(|records| {
            records.insert(task.id.clone(), task.clone());
        })
        .await
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StorageError> {
        self.modify(|records| {
            records.remove(id);
        })
        .await
    }
}
