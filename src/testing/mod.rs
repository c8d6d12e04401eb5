//! Testing utilities for users of the crony library.
//!
//! This module provides helpers for testing code built on the engine:
//!
//! - [`EventRecorder`]: An event handler that keeps every event it sees
//! - [`TestHarness`]: An engine over in-memory storage with no scheduler loop
//! - [`wait_for_result`]: Waits on a subscription for a run to finish

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::core::task::{LastResult, TaskDraft};
use crate::core::types::{RunId, TaskId};
use crate::engine::{Engine, EngineError};
use crate::events::{Event, EventBus, EventHandler, EventSubscription};

/// Records every event published on a bus.
///
/// # Example
///
/// ```no_run
/// use crony::EventBus;
/// use crony::testing::EventRecorder;
///
/// # async fn example() {
/// let bus = EventBus::default();
/// let (recorder, _task) = EventRecorder::attach(&bus);
/// // ... run something that emits events ...
/// let events = recorder.events();
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder and register it on `bus`.
    pub fn attach(bus: &EventBus) -> (Self, JoinHandle<()>) {
        let recorder = Self::new();
        let task = bus.register(Arc::new(recorder.clone()));
        (recorder, task)
    }

    /// Everything recorded so far, in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Results carried by the state-changed events of one task.
    pub fn states(&self, task_id: &TaskId) -> Vec<LastResult> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                Event::TaskStateChanged {
                    task_id: id,
                    result,
                    ..
                } if id == task_id => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated output chunks of one run.
    pub fn output(&self, run_id: &RunId) -> String {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                Event::TaskOutputChunk {
                    run_id: id, text, ..
                } if id == run_id => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Poll until `predicate` holds for the recorded events or `timeout` passes.
    pub async fn wait_until(&self, timeout: Duration, predicate: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.lock()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: &Event) {
        self.lock().push(event.clone());
    }
}

/// Wait for the terminal state-changed event of `task_id`.
///
/// Returns `None` if the timeout passes or the bus closes first.
pub async fn wait_for_result(
    subscription: &mut EventSubscription,
    task_id: &TaskId,
    timeout: Duration,
) -> Option<LastResult> {
    let wait = async {
        while let Some(event) = subscription.recv().await {
            if let Event::TaskStateChanged {
                task_id: id,
                result,
                ..
            } = event
            {
                if &id == task_id && !result.is_running() {
                    return Some(result);
                }
            }
        }
        None
    };

    tokio::time::timeout(timeout, wait).await.ok().flatten()
}

/// An engine over in-memory storage with the scheduler loop off.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use crony::testing::TestHarness;
///
/// # async fn example() {
/// let harness = TestHarness::new().await;
/// let (task_id, result) = harness
///     .run_to_completion("greet", "echo hello", Duration::from_secs(5))
///     .await
///     .unwrap();
/// # }
/// ```
pub struct TestHarness {
    engine: Engine,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::ephemeral()).await
    }

    /// Build from a config; storage is always in-memory.
    pub async fn with_config(config: EngineConfig) -> Self {
        let config = EngineConfig {
            storage: crate::config::StorageConfig::Memory,
            ..config
        };
        match Engine::builder(config).without_scheduler().build().await {
            Ok(engine) => Self { engine },
            Err(e) => panic!("in-memory engine failed to open: {e}"),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Create a manual task, run it and wait for its result.
    pub async fn run_to_completion(
        &self,
        name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<(TaskId, Option<LastResult>), EngineError> {
        let saved = self.engine.create_task(TaskDraft::new(name, command)).await?;
        let task_id = saved.task.id;

        let mut subscription = self.engine.subscribe();
        self.engine.run_task(&task_id).await?;
        let result = wait_for_result(&mut subscription, &task_id, timeout).await;
        Ok((task_id, result))
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
