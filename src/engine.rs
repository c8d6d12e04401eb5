//! The engine: command surface over the task store, run coordinator,
//! scheduler loop and event bus.
//!
//! # Example
//!
//! ```no_run
//! use crony::config::EngineConfig;
//! use crony::{Engine, TaskDraft};
//!
//! # async fn example() -> Result<(), crony::EngineError> {
//! let engine = Engine::open(EngineConfig::default()).await?;
//! let saved = engine
//!     .create_task(TaskDraft::new("Backup", "tar czf /tmp/b.tgz ~/docs").with_schedule("0 3 * * *"))
//!     .await?;
//! engine.run_task(&saved.task.id).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, EngineConfig, StorageConfig};
use crate::core::schedule::{ScheduleError, next_trigger};
use crate::core::task::{Task, TaskDraft, ValidationError};
use crate::core::types::{RunId, TaskId};
use crate::events::{EventBus, EventSubscription};
use crate::execution::{ProcessExecutor, RunCoordinator, RunError, RunInfo, RunLimits, TriggerReason};
use crate::scheduler::{Scheduler, SchedulerError, SchedulerHandle};
use crate::storage::{InMemoryStorage, JsonFileStorage, Storage, StorageError, StoreError, TaskStore};

/// Errors returned by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("task is already running: {0}")]
    AlreadyRunning(TaskId),

    #[error("task is not running: {0}")]
    NotRunning(TaskId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Validation(e) => EngineError::Validation(e),
            StoreError::Storage(e) => EngineError::Storage(e),
        }
    }
}

impl From<RunError> for EngineError {
    fn from(error: RunError) -> Self {
        match error {
            RunError::NotFound(id) => EngineError::NotFound(id),
            RunError::NotRunning(id) => EngineError::NotRunning(id),
            RunError::AlreadyRunning(id) => EngineError::AlreadyRunning(id),
            RunError::Store(e) => e.into(),
        }
    }
}

/// A saved task plus any problem found in its schedule.
///
/// An unusable schedule does not block saving; the task is kept but never
/// auto-triggers.
#[derive(Debug, Clone)]
pub struct TaskSaved {
    pub task: Task,
    pub schedule_error: Option<ScheduleError>,
}

impl TaskSaved {
    fn check(task: Task) -> Self {
        let schedule_error = task
            .schedule_expression()
            .and_then(|expression| next_trigger(expression, Local::now()).err());
        if let Some(e) = &schedule_error {
            tracing::warn!(task_id = %task.id, error = %e, "task saved with unusable schedule");
        }
        Self {
            task,
            schedule_error,
        }
    }
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn Storage>>,
    scheduler: bool,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            storage: None,
            scheduler: true,
        }
    }

    /// Use this backend instead of the one named in the configuration.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Do not start the scheduler loop; tasks only run when asked to.
    pub fn without_scheduler(mut self) -> Self {
        self.scheduler = false;
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        let storage = match self.storage {
            Some(storage) => storage,
            None => open_storage(&config).await?,
        };
        let store = Arc::new(TaskStore::open(storage).await?);

        let events = EventBus::new(config.event_capacity);
        let executor = ProcessExecutor::new(config.shell.clone().unwrap_or_default())
            .with_stop_grace(config.stop_grace())
            .with_fallback_encoding(config.output_fallback()?);
        let coordinator = RunCoordinator::new(
            store.clone(),
            executor,
            events.clone(),
            RunLimits {
                max_result_bytes: config.max_result_bytes,
                max_buffer_bytes: config.max_buffer_bytes,
            },
        );

        let (scheduler, scheduler_task) = if self.scheduler {
            let (handle, task) = Scheduler::new(store.clone(), coordinator.clone())
                .with_max_nap(config.max_nap())
                .start()
                .await;
            (Some(handle), Some(task))
        } else {
            (None, None)
        };

        Ok(Engine {
            config,
            store,
            coordinator,
            events,
            scheduler,
            scheduler_task: Mutex::new(scheduler_task),
        })
    }
}

/// Open the backend described by `config`.
pub async fn open_storage(config: &EngineConfig) -> Result<Arc<dyn Storage>, EngineError> {
    let Some(path) = config.storage_path()? else {
        return Ok(Arc::new(InMemoryStorage::new()));
    };

    match &config.storage {
        StorageConfig::Json { .. } => {
            tracing::info!(path = %path.display(), "using JSON task store");
            Ok(Arc::new(JsonFileStorage::new(path)))
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { .. } => {
            tracing::info!(path = %path.display(), "using SQLite task store");
            Ok(Arc::new(crate::storage::SqliteStorage::new(path).await?))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => Err(ConfigError::InvalidConfig(
            "sqlite storage requested but crony was built without the `sqlite` feature".into(),
        )
        .into()),
        StorageConfig::Memory => Ok(Arc::new(InMemoryStorage::new())),
    }
}

/// The automation engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<TaskStore>,
    coordinator: RunCoordinator,
    events: EventBus,
    scheduler: Option<SchedulerHandle>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open the configured store and start the scheduler.
    pub async fn open(config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build().await
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// All tasks, oldest first.
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.store.list().await
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task, EngineError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn create_task(&self, draft: TaskDraft) -> Result<TaskSaved, EngineError> {
        let task = self.store.create(draft).await?;
        Ok(TaskSaved::check(task))
    }

    /// Replace the editable fields of a task. A live run is left alone.
    pub async fn update_task(&self, id: &TaskId, draft: TaskDraft) -> Result<TaskSaved, EngineError> {
        let task = self.store.update(id, draft).await?;
        Ok(TaskSaved::check(task))
    }

    /// Delete a task. A live run finishes and its result is discarded.
    pub async fn delete_task(&self, id: &TaskId) -> Result<(), EngineError> {
        self.store.delete(id).await?;
        Ok(())
    }

    /// Start a manual run.
    pub async fn run_task(&self, id: &TaskId) -> Result<RunId, EngineError> {
        Ok(self.coordinator.trigger(id, TriggerReason::Manual).await?)
    }

    /// Ask the live run of a task to stop. Returns without waiting for exit.
    pub async fn stop_task(&self, id: &TaskId) -> Result<(), EngineError> {
        Ok(self.coordinator.stop(id).await?)
    }

    /// Output buffered so far by the live run of a task.
    pub fn live_output(&self, id: &TaskId) -> Option<String> {
        self.coordinator.live_output(id)
    }

    pub fn is_running(&self, id: &TaskId) -> bool {
        self.coordinator.is_running(id)
    }

    /// All live runs.
    pub fn running(&self) -> Vec<RunInfo> {
        self.coordinator.running()
    }

    /// When the task will next be triggered automatically, if ever.
    pub async fn next_trigger(&self, id: &TaskId) -> Result<Option<DateTime<Local>>, EngineError> {
        let task = self.store.get(id).await?;
        Ok(self
            .next_triggers(std::slice::from_ref(&task))
            .await?
            .remove(id))
    }

    /// Next automatic trigger of every task in `tasks` that has one.
    ///
    /// The scheduler is asked once for the whole set; tasks it does not
    /// hold yet are computed from now.
    pub async fn next_triggers(
        &self,
        tasks: &[Task],
    ) -> Result<HashMap<TaskId, DateTime<Local>>, EngineError> {
        let mut scheduled: HashMap<TaskId, DateTime<Local>> = match &self.scheduler {
            Some(scheduler) => scheduler
                .next_triggers()
                .await?
                .into_iter()
                .map(|next| (next.task_id, next.at))
                .collect(),
            None => HashMap::new(),
        };

        let now = Local::now();
        Ok(tasks
            .iter()
            .filter(|task| task.is_auto_triggered())
            .filter_map(|task| {
                let at = scheduled.remove(&task.id).or_else(|| {
                    task.schedule_expression()
                        .and_then(|expression| next_trigger(expression, now).ok())
                })?;
                Some((task.id.clone(), at))
            })
            .collect())
    }

    /// Receive engine events from now on.
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle to the scheduler loop, when it was started.
    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop the scheduler, then cancel live runs and wait for them to finish.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.shutdown().await {
                tracing::debug!(error = %e, "scheduler already stopped");
            }
        }
        if let Some(task) = self.scheduler_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        self.coordinator.shutdown().await;
        tracing::info!("engine stopped");
    }
}
