//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::core::task::{Task, TaskDraft};
use crate::core::types::TaskId;
use crate::engine::Engine;
use crate::scheduler::SchedulerHandle;

use super::errors::ApiError;
use super::responses::{
    HealthResponse, MessageResponse, OutputResponse, RunResponse, RunningResponse,
    SchedulerStateResponse, TaskListResponse, TaskResponse, TaskSavedResponse,
};

/// Shared application state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn scheduler(&self) -> Result<&SchedulerHandle, ApiError> {
        self.engine
            .scheduler()
            .ok_or_else(|| ApiError::ServiceUnavailable("scheduler is not running".to_string()))
    }

    async fn describe(&self, task: Task) -> Result<TaskResponse, ApiError> {
        let next_trigger = self.engine.next_trigger(&task.id).await?;
        Ok(TaskResponse {
            running: self.engine.is_running(&task.id),
            next_trigger,
            task,
        })
    }
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Get scheduler state.
pub async fn get_scheduler_state(
    State(state): State<ApiState>,
) -> Result<Json<SchedulerStateResponse>, ApiError> {
    let scheduler_state = state.scheduler()?.state().await;
    Ok(Json(SchedulerStateResponse::from(scheduler_state)))
}

/// Pause the scheduler.
pub async fn pause_scheduler(
    State(state): State<ApiState>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.scheduler()?.pause().await?;
    Ok(Json(MessageResponse {
        message: "scheduler paused".to_string(),
    }))
}

/// Resume the scheduler.
pub async fn resume_scheduler(
    State(state): State<ApiState>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.scheduler()?.resume().await?;
    Ok(Json(MessageResponse {
        message: "scheduler resumed".to_string(),
    }))
}

/// List all tasks.
pub async fn list_tasks(State(state): State<ApiState>) -> Result<Json<TaskListResponse>, ApiError> {
    let tasks = state.engine.list_tasks().await;
    let mut next_triggers = state.engine.next_triggers(&tasks).await?;
    let tasks: Vec<TaskResponse> = tasks
        .into_iter()
        .map(|task| TaskResponse {
            running: state.engine.is_running(&task.id),
            next_trigger: next_triggers.remove(&task.id),
            task,
        })
        .collect();
    let count = tasks.len();
    Ok(Json(TaskListResponse { tasks, count }))
}

/// Create a task.
pub async fn create_task(
    State(state): State<ApiState>,
    Json(draft): Json<TaskDraft>,
) -> Result<(StatusCode, Json<TaskSavedResponse>), ApiError> {
    let saved = state.engine.create_task(draft).await?;
    Ok((StatusCode::CREATED, Json(saved.into())))
}

/// Get a specific task.
pub async fn get_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state.engine.get_task(&TaskId::from(task_id)).await?;
    Ok(Json(state.describe(task).await?))
}

/// Replace a task's editable fields.
pub async fn update_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(draft): Json<TaskDraft>,
) -> Result<Json<TaskSavedResponse>, ApiError> {
    let saved = state.engine.update_task(&TaskId::from(task_id), draft).await?;
    Ok(Json(saved.into()))
}

/// Delete a task.
pub async fn delete_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let task_id = TaskId::from(task_id);
    state.engine.delete_task(&task_id).await?;
    Ok(Json(MessageResponse {
        message: format!("task '{}' deleted", task_id),
    }))
}

/// Start a manual run.
pub async fn run_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let task_id = TaskId::from(task_id);
    let run_id = state.engine.run_task(&task_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunResponse {
            task_id: task_id.to_string(),
            run_id: run_id.to_string(),
            message: format!("task '{}' started", task_id),
        }),
    ))
}

/// Stop the live run of a task.
pub async fn stop_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let task_id = TaskId::from(task_id);
    state.engine.stop_task(&task_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("stop requested for task '{}'", task_id),
        }),
    ))
}

/// Output buffered by the live run of a task.
pub async fn task_output(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<OutputResponse>, ApiError> {
    let task_id = TaskId::from(task_id);
    // 404 for unknown ids rather than an empty body.
    state.engine.get_task(&task_id).await?;
    let output = state.engine.live_output(&task_id);
    Ok(Json(OutputResponse {
        task_id: task_id.to_string(),
        running: output.is_some(),
        output,
    }))
}

/// Live runs across all tasks.
pub async fn list_running(State(state): State<ApiState>) -> Json<RunningResponse> {
    let runs = state.engine.running();
    let count = runs.len();
    Json(RunningResponse { runs, count })
}

/// Engine events as Server-Sent Events, named after the event kind.
pub async fn events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.engine.subscribe().into_inner()).filter_map(|item| {
        match item {
            Ok(event) => match SseEvent::default().event(event.name()).json_data(&event) {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode event");
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(lost)) => {
                tracing::warn!(lost, "event stream client lagged, events dropped");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
