//! API response types.

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::core::task::Task;
use crate::engine::TaskSaved;
use crate::execution::RunInfo;
use crate::scheduler::SchedulerState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Scheduler state response.
#[derive(Debug, Serialize)]
pub struct SchedulerStateResponse {
    pub state: SchedulerState,
    pub is_running: bool,
    pub is_paused: bool,
}

impl From<SchedulerState> for SchedulerStateResponse {
    fn from(state: SchedulerState) -> Self {
        Self {
            state,
            is_running: state == SchedulerState::Running,
            is_paused: state == SchedulerState::Paused,
        }
    }
}

/// A task as returned by the API, with live scheduling facts attached.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub task: Task,
    pub running: bool,
    pub next_trigger: Option<DateTime<Local>>,
}

/// List of tasks response.
#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub count: usize,
}

/// Response to a create or update.
#[derive(Debug, Serialize)]
pub struct TaskSavedResponse {
    pub task: Task,
    pub schedule_error: Option<String>,
}

impl From<TaskSaved> for TaskSavedResponse {
    fn from(saved: TaskSaved) -> Self {
        Self {
            task: saved.task,
            schedule_error: saved.schedule_error.map(|e| e.to_string()),
        }
    }
}

/// Response to a run request.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub task_id: String,
    pub run_id: String,
    pub message: String,
}

/// Live output of a task.
#[derive(Debug, Serialize)]
pub struct OutputResponse {
    pub task_id: String,
    pub running: bool,
    pub output: Option<String>,
}

/// Live runs response.
#[derive(Debug, Serialize)]
pub struct RunningResponse {
    pub runs: Vec<RunInfo>,
    pub count: usize,
}

/// Generic message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
