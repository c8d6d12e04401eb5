//! Task definitions and run results.
//!
//! A [`Task`] is the persisted unit of automation: a shell command with an
//! optional cron schedule. [`TaskDraft`] is the user-editable subset used to
//! create and update tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::TaskId;

/// Default cap on the output kept in a task's last result (20 KiB).
pub const DEFAULT_MAX_RESULT_BYTES: usize = 20 * 1024;

/// Errors raised when a draft or stored record fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Name is empty after trimming.
    #[error("task name must not be empty")]
    EmptyName,

    /// Command is empty after trimming.
    #[error("task command must not be empty")]
    EmptyCommand,
}

/// Summarized outcome of a task's most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LastResult {
    /// A run is in progress.
    Running,
    /// The command exited with status zero.
    Success {
        #[serde(default)]
        output: String,
    },
    /// The command failed: non-zero exit, killed by a signal, or could not start.
    Error {
        message: String,
        #[serde(default)]
        output: String,
    },
    /// The run was stopped on request.
    Cancelled {
        #[serde(default)]
        output: String,
    },
    /// The engine went away while the run was live.
    Interrupted,
}

impl LastResult {
    /// Check if this result marks an in-progress run.
    pub fn is_running(&self) -> bool {
        matches!(self, LastResult::Running)
    }

    /// Captured output, if this result carries any.
    pub fn output(&self) -> Option<&str> {
        match self {
            LastResult::Success { output }
            | LastResult::Error { output, .. }
            | LastResult::Cancelled { output } => Some(output),
            LastResult::Running | LastResult::Interrupted => None,
        }
    }

    /// Short lowercase label, matching the serialized `status` tag.
    pub fn label(&self) -> &'static str {
        match self {
            LastResult::Running => "running",
            LastResult::Success { .. } => "success",
            LastResult::Error { .. } => "error",
            LastResult::Cancelled { .. } => "cancelled",
            LastResult::Interrupted => "interrupted",
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// User-editable fields of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub schedule: Option<String>,
    pub command: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl TaskDraft {
    /// Create an enabled, manual-only draft.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule: None,
            command: command.into(),
            enabled: true,
        }
    }

    /// Set the cron schedule.
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Set enabled status.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Reject drafts with a blank name or command.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(&self.name, &self.command)
    }

    /// Schedule with surrounding whitespace removed; blank means none.
    fn normalized_schedule(&self) -> Option<String> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

fn validate_fields(name: &str, command: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if command.trim().is_empty() {
        return Err(ValidationError::EmptyCommand);
    }
    Ok(())
}

/// A persisted automation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub schedule: Option<String>,
    pub command: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<LastResult>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a new task from a validated draft.
    pub fn from_draft(
        id: TaskId,
        draft: TaskDraft,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        draft.validate()?;
        let schedule = draft.normalized_schedule();
        Ok(Self {
            id,
            name: draft.name.trim().to_string(),
            schedule,
            command: draft.command,
            enabled: draft.enabled,
            last_run_at: None,
            last_result: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the editable fields, leaving run bookkeeping untouched.
    pub fn apply_draft(
        &mut self,
        draft: TaskDraft,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        draft.validate()?;
        self.schedule = draft.normalized_schedule();
        self.name = draft.name.trim().to_string();
        self.command = draft.command;
        self.enabled = draft.enabled;
        self.updated_at = now;
        Ok(())
    }

    /// Check a stored record for the same rules drafts must satisfy.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_fields(&self.name, &self.command)
    }

    /// The schedule expression, if the task has a non-blank one.
    pub fn schedule_expression(&self) -> Option<&str> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Whether the scheduler should consider this task at all.
    pub fn is_auto_triggered(&self) -> bool {
        self.enabled && self.schedule_expression().is_some()
    }

    /// Whether the last result says a run is in progress.
    pub fn is_running(&self) -> bool {
        self.last_result.as_ref().is_some_and(LastResult::is_running)
    }

    /// The editable subset of this task.
    pub fn to_draft(&self) -> TaskDraft {
        TaskDraft {
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            command: self.command.clone(),
            enabled: self.enabled,
        }
    }
}

/// Keep at most `max_bytes` of the end of `output`.
///
/// When anything is dropped, a marker line stating how many bytes were
/// hidden is prepended. The cut always lands on a char boundary.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    truncate_tail(output, max_bytes, 0)
}

/// Like [`truncate_output`], for text whose head was already cut off.
/// `already_hidden` bytes are added to the reported count.
pub(crate) fn truncate_tail(output: &str, max_bytes: usize, already_hidden: usize) -> String {
    let mut start = output.len().saturating_sub(max_bytes);
    while !output.is_char_boundary(start) {
        start += 1;
    }

    let hidden = already_hidden + start;
    if hidden == 0 {
        return output.to_string();
    }

    format!(
        "... [output truncated, {} bytes hidden] ...\n{}",
        hidden,
        &output[start..]
    )
}
