//! Run lifecycle events and their distribution.
//!
//! The [`EventBus`] is a broadcast channel: every subscriber gets its own
//! bounded queue, emitting never blocks, and a subscriber that falls behind
//! loses its oldest undelivered events rather than slowing the engine down.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

use crate::core::task::LastResult;
use crate::core::types::{RunId, TaskId};

/// Default per-subscriber queue length.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Which pipe of the child process a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Events published while tasks run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// A task's `last_result` changed: a run started or finished.
    TaskStateChanged {
        task_id: TaskId,
        run_id: RunId,
        result: LastResult,
    },

    /// A fragment of output from a running task.
    TaskOutputChunk {
        task_id: TaskId,
        run_id: RunId,
        stream: OutputStream,
        text: String,
    },
}

impl Event {
    /// Create a TaskStateChanged event.
    pub fn state_changed(task_id: TaskId, run_id: RunId, result: LastResult) -> Self {
        Event::TaskStateChanged {
            task_id,
            run_id,
            result,
        }
    }

    /// Create a TaskOutputChunk event.
    pub fn output_chunk(
        task_id: TaskId,
        run_id: RunId,
        stream: OutputStream,
        text: impl Into<String>,
    ) -> Self {
        Event::TaskOutputChunk {
            task_id,
            run_id,
            stream,
            text: text.into(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::TaskStateChanged { .. } => "task-state-changed",
            Event::TaskOutputChunk { .. } => "task-output-chunk",
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            Event::TaskStateChanged { task_id, .. } | Event::TaskOutputChunk { task_id, .. } => {
                task_id
            }
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Event::TaskStateChanged { run_id, .. } | Event::TaskOutputChunk { run_id, .. } => {
                run_id
            }
        }
    }
}

/// Handler for receiving events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Broadcast bus for engine events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Start receiving events published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            lost: 0,
        }
    }

    /// Feed every future event to `handler` on a background task.
    ///
    /// The task ends when the bus is dropped.
    pub fn register(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler.handle(&event).await;
            }
        })
    }

    /// Number of live subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// One subscriber's view of the bus.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
    lost: u64,
}

impl EventSubscription {
    /// Wait for the next event, skipping over any the subscriber lagged past.
    ///
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.note_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total number of events dropped because this subscriber fell behind.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Unwrap into the raw broadcast receiver, e.g. for stream adapters.
    pub fn into_inner(self) -> broadcast::Receiver<Event> {
        self.receiver
    }

    fn note_lag(&mut self, skipped: u64) {
        self.lost += skipped;
        tracing::warn!(skipped, "event subscriber lagged, oldest events dropped");
    }
}
