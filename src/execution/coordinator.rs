//! Run coordination: one live run per task, results written back to the
//! store, lifecycle published on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::process::{ExitOutcome, ProcessExecutor};
use crate::core::task::{DEFAULT_MAX_RESULT_BYTES, LastResult, Task, truncate_tail};
use crate::core::types::{RunId, TaskId};
use crate::events::{Event, EventBus};
use crate::storage::{StoreError, TaskStore};

/// Default cap on output held in memory for a live run (1 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Errors returned by run coordination.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task is not running: {0}")]
    NotRunning(TaskId),

    #[error("task is already running: {0}")]
    AlreadyRunning(TaskId),

    #[error("failed to record run start: {0}")]
    Store(#[source] StoreError),
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerReason {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Scheduled => write!(f, "scheduled"),
            TriggerReason::Manual => write!(f, "manual"),
        }
    }
}

/// Output size limits applied to runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Bytes of output kept in a task's stored result.
    pub max_result_bytes: usize,
    /// Bytes of output held in memory while a run is live.
    pub max_buffer_bytes: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Snapshot of a live run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub reason: TriggerReason,
    pub started_at: DateTime<Utc>,
}

/// Tail-keeping output buffer.
#[derive(Debug)]
struct OutputBuffer {
    text: String,
    capacity: usize,
    dropped: usize,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            text: String::new(),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() <= self.capacity {
            return;
        }

        let mut cut = self.text.len() - self.capacity;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.dropped += cut;
    }

    fn summarize(&self, max_bytes: usize) -> String {
        truncate_tail(&self.text, max_bytes, self.dropped)
    }
}

struct LiveRun {
    run_id: RunId,
    reason: TriggerReason,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    buffer: Arc<Mutex<OutputBuffer>>,
}

struct Inner {
    store: Arc<TaskStore>,
    executor: ProcessExecutor,
    events: EventBus,
    limits: RunLimits,
    live: Mutex<HashMap<TaskId, LiveRun>>,
    tracker: TaskTracker,
}

/// Starts, tracks and stops task runs.
///
/// Cloning yields another handle to the same live-run table.
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunCoordinator {
    pub fn new(
        store: Arc<TaskStore>,
        executor: ProcessExecutor,
        events: EventBus,
        limits: RunLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                events,
                limits,
                live: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Start a run of `task_id` unless one is already live.
    ///
    /// Returns once the run is registered and marked running; the process
    /// itself is spawned on the run's own task.
    pub async fn trigger(
        &self,
        task_id: &TaskId,
        reason: TriggerReason,
    ) -> Result<RunId, RunError> {
        if let Err(e) = self.inner.store.get(task_id).await {
            return Err(store_error(e));
        }

        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(
            self.inner.limits.max_buffer_bytes,
        )));
        let started_at = Utc::now();

        {
            let mut live = lock(&self.inner.live);
            if live.contains_key(task_id) {
                return Err(RunError::AlreadyRunning(task_id.clone()));
            }
            live.insert(
                task_id.clone(),
                LiveRun {
                    run_id: run_id.clone(),
                    reason,
                    started_at,
                    cancel: cancel.clone(),
                    buffer: buffer.clone(),
                },
            );
        }

        let task = match self.inner.store.mark_started(task_id, started_at).await {
            Ok(task) => task,
            Err(e) => {
                self.release(task_id, &run_id);
                return Err(store_error(e));
            }
        };

        tracing::info!(task_id = %task_id, run_id = %run_id, reason = %reason, "run started");
        self.inner.events.emit(Event::state_changed(
            task_id.clone(),
            run_id.clone(),
            LastResult::Running,
        ));

        let this = self.clone();
        let spawned_run_id = run_id.clone();
        self.inner.tracker.spawn(async move {
            this.drive(task, spawned_run_id, cancel, buffer).await;
        });

        Ok(run_id)
    }

    /// Ask the live run of `task_id` to stop. Returns immediately.
    pub async fn stop(&self, task_id: &TaskId) -> Result<(), RunError> {
        let token = lock(&self.inner.live)
            .get(task_id)
            .map(|run| run.cancel.clone());

        match token {
            Some(token) => {
                tracing::info!(task_id = %task_id, "stop requested");
                token.cancel();
                Ok(())
            }
            None => match self.inner.store.get(task_id).await {
                Ok(_) => Err(RunError::NotRunning(task_id.clone())),
                Err(_) => Err(RunError::NotFound(task_id.clone())),
            },
        }
    }

    /// Output buffered so far by the live run of `task_id`.
    pub fn live_output(&self, task_id: &TaskId) -> Option<String> {
        let buffer = lock(&self.inner.live)
            .get(task_id)
            .map(|run| run.buffer.clone())?;
        let text = lock(&buffer).text.clone();
        Some(text)
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        lock(&self.inner.live).contains_key(task_id)
    }

    /// All live runs, oldest first.
    pub fn running(&self) -> Vec<RunInfo> {
        let live = lock(&self.inner.live);
        let mut runs: Vec<_> = live
            .iter()
            .map(|(task_id, run)| RunInfo {
                task_id: task_id.clone(),
                run_id: run.run_id.clone(),
                reason: run.reason,
                started_at: run.started_at,
            })
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    /// Stop every live run and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let tokens: Vec<_> = lock(&self.inner.live)
            .values()
            .map(|run| run.cancel.clone())
            .collect();
        if !tokens.is_empty() {
            tracing::info!(count = tokens.len(), "stopping live runs");
        }
        for token in tokens {
            token.cancel();
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Remove the live entry, but only if it still belongs to `run_id`.
    fn release(&self, task_id: &TaskId, run_id: &RunId) {
        let mut live = lock(&self.inner.live);
        if live.get(task_id).is_some_and(|run| &run.run_id == run_id) {
            live.remove(task_id);
        }
    }

    async fn drive(
        self,
        task: Task,
        run_id: RunId,
        cancel: CancellationToken,
        buffer: Arc<Mutex<OutputBuffer>>,
    ) {
        let task_id = task.id.clone();
        let result = self.execute(&task, &run_id, &cancel, &buffer).await;

        match self.inner.store.record_result(&task_id, result.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(task_id = %task_id, run_id = %run_id, "task deleted during run, result discarded")
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, run_id = %run_id, error = %e, "failed to persist run result")
            }
        }

        // Released before the final event so subscribers can re-run at once.
        self.release(&task_id, &run_id);

        tracing::info!(task_id = %task_id, run_id = %run_id, status = result.label(), "run finished");
        self.inner
            .events
            .emit(Event::state_changed(task_id, run_id, result));
    }

    async fn execute(
        &self,
        task: &Task,
        run_id: &RunId,
        cancel: &CancellationToken,
        buffer: &Mutex<OutputBuffer>,
    ) -> LastResult {
        if cancel.is_cancelled() {
            return LastResult::Cancelled {
                output: String::new(),
            };
        }

        let mut process = match self.inner.executor.start(&task.command) {
            Ok(process) => process,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to start process");
                return LastResult::Error {
                    message: format!("failed to start: {}", e),
                    output: String::new(),
                };
            }
        };

        let mut terminated = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !terminated => {
                    process.terminate();
                    terminated = true;
                }
                chunk = process.next_chunk() => match chunk {
                    Some(chunk) => {
                        lock(buffer).push(&chunk.text);
                        self.inner.events.emit(Event::output_chunk(
                            task.id.clone(),
                            run_id.clone(),
                            chunk.stream,
                            chunk.text,
                        ));
                    }
                    None => break,
                },
            }
        }

        let killer = process.killer();
        let wait = process.wait();
        tokio::pin!(wait);
        let exit = tokio::select! {
            exit = &mut wait => exit,
            _ = cancel.cancelled(), if !terminated => {
                killer.terminate();
                wait.await
            }
        };

        let output = lock(buffer).summarize(self.inner.limits.max_result_bytes);
        if cancel.is_cancelled() {
            return LastResult::Cancelled { output };
        }

        match exit {
            Ok(ExitOutcome::Success) => LastResult::Success { output },
            Ok(outcome) => LastResult::Error {
                message: outcome.describe(),
                output,
            },
            Err(e) => LastResult::Error {
                message: e.to_string(),
                output,
            },
        }
    }
}

fn store_error(e: StoreError) -> RunError {
    match e {
        StoreError::NotFound(id) => RunError::NotFound(id),
        other => RunError::Store(other),
    }
}
