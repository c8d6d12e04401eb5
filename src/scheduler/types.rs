//! Scheduler type definitions.
//!
//! This module contains error types, state enums, and command types for the scheduler.

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::types::TaskId;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler loop is gone or did not answer.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// Upcoming automatic trigger of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextTrigger {
    pub task_id: TaskId,
    pub expression: String,
    pub at: DateTime<Local>,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
    /// Snapshot the working set.
    NextTriggers {
        response: oneshot::Sender<Vec<NextTrigger>>,
    },
}
