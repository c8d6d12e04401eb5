//! crony: a local automation engine.
//!
//! Tasks pair a shell command with an optional cron schedule. The engine
//! persists them, triggers them on time or on demand, streams their output
//! to subscribers and lets callers stop them mid-run.

pub mod api;
pub mod config;
pub mod core;
pub mod engine;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use core::schedule::{Schedule, ScheduleError, next_trigger};
pub use core::task::{LastResult, Task, TaskDraft, ValidationError, truncate_output};
pub use core::types::{RunId, TaskId};
pub use engine::{Engine, EngineBuilder, EngineError, TaskSaved};
pub use events::{Event, EventBus, EventSubscription, OutputStream};
pub use execution::{RunCoordinator, RunError, TriggerReason};
pub use scheduler::{NextTrigger, SchedulerHandle, SchedulerState};
pub use storage::{Storage, StorageError, StoreError, TaskStore};
