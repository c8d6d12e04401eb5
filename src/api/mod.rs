//! HTTP API module for the crony engine.
//!
//! Provides REST endpoints for task management and manual runs, a
//! Server-Sent Events stream of engine events, and scheduler control.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::ApiState;
pub use responses::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::engine::Engine;

/// Build the API router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Scheduler control
        .route("/api/scheduler/state", get(handlers::get_scheduler_state))
        .route("/api/scheduler/pause", post(handlers::pause_scheduler))
        .route("/api/scheduler/resume", post(handlers::resume_scheduler))
        // Tasks
        .route(
            "/api/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/api/tasks/{task_id}",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route("/api/tasks/{task_id}/run", post(handlers::run_task))
        .route("/api/tasks/{task_id}/stop", post(handlers::stop_task))
        .route("/api/tasks/{task_id}/output", get(handlers::task_output))
        // Runs and events
        .route("/api/runs", get(handlers::list_running))
        .route("/api/events", get(handlers::events))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from an engine.
pub fn create_api_state(engine: Arc<Engine>) -> ApiState {
    ApiState::new(engine)
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server(
    config: &ApiConfig,
    state: ApiState,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
