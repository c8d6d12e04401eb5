//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Triggering enabled tasks when their cron schedule comes due
//! - Picking up task edits without a restart
//! - Pause and resume functionality
//!
//! It keeps the next trigger instant of every scheduled task and sleeps
//! until the soonest one, waking early whenever the task store changes and
//! at least every `max_nap` so wall-clock jumps are noticed.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::schedule::next_trigger;
use crate::core::types::TaskId;
use crate::execution::{RunCoordinator, RunError, TriggerReason};
use crate::storage::TaskStore;

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{NextTrigger, SchedulerCommand, SchedulerState};

/// Default upper bound on a single sleep of the loop.
pub const DEFAULT_MAX_NAP: Duration = Duration::from_secs(60);

/// One scheduled task in the working set.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    expression: String,
    next: DateTime<Local>,
}

/// Background driver that triggers scheduled tasks.
pub struct Scheduler {
    store: Arc<TaskStore>,
    coordinator: RunCoordinator,
    max_nap: Duration,
}

impl Scheduler {
    /// Create a new scheduler over the given store and coordinator.
    pub fn new(store: Arc<TaskStore>, coordinator: RunCoordinator) -> Self {
        Self {
            store,
            coordinator,
            max_nap: DEFAULT_MAX_NAP,
        }
    }

    /// Set the longest the loop sleeps without re-checking the clock.
    pub fn with_max_nap(mut self, max_nap: Duration) -> Self {
        self.max_nap = max_nap;
        self
    }

    /// Build the initial working set and start the loop.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let changes = self.store.subscribe_changes();

        let mut entries = HashMap::new();
        self.rescan(&mut entries, Local::now()).await;
        tracing::info!(scheduled = entries.len(), "scheduler started");

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(entries, changes, command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    async fn run(
        self,
        mut entries: HashMap<TaskId, Entry>,
        mut changes: watch::Receiver<u64>,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut store_open = true;

        loop {
            let paused = *state.read().await == SchedulerState::Paused;
            let nap = if paused {
                self.max_nap
            } else {
                self.nap_until_next(&entries)
            };

            tokio::select! {
                _ = tokio::time::sleep(nap) => {
                    if !paused {
                        self.fire_due(&mut entries).await;
                    }
                }

                changed = changes.changed(), if store_open => {
                    if changed.is_err() {
                        store_open = false;
                        continue;
                    }
                    self.rescan(&mut entries, Local::now()).await;
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        *state.write().await = SchedulerState::Stopped;
                        tracing::debug!("all scheduler handles dropped, stopping");
                        break;
                    };
                    match command {
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            tracing::info!("scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *state.write().await = SchedulerState::Running;
                            // Recompute from now so nothing that fell due during the pause fires.
                            entries.clear();
                            self.rescan(&mut entries, Local::now()).await;
                            tracing::info!("scheduler resumed, skipping any triggers missed during pause");
                            let _ = response.send(());
                        }
                        SchedulerCommand::NextTriggers { response } => {
                            let _ = response.send(snapshot(&entries));
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            tracing::info!("scheduler stopped");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    fn nap_until_next(&self, entries: &HashMap<TaskId, Entry>) -> Duration {
        let Some(soonest) = entries.values().map(|entry| entry.next).min() else {
            return self.max_nap;
        };
        (soonest - Local::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.max_nap)
    }

    /// Rebuild the working set from the store.
    ///
    /// Entries whose expression did not change keep their computed instant.
    async fn rescan(&self, entries: &mut HashMap<TaskId, Entry>, now: DateTime<Local>) {
        let tasks = self.store.list().await;
        let mut next_entries = HashMap::with_capacity(tasks.len());

        for task in tasks.iter().filter(|task| task.is_auto_triggered()) {
            let Some(expression) = task.schedule_expression() else {
                continue;
            };

            if let Some(existing) = entries.remove(&task.id) {
                if existing.expression == expression {
                    next_entries.insert(task.id.clone(), existing);
                    continue;
                }
            }

            match next_trigger(expression, now) {
                Ok(next) => {
                    tracing::debug!(task_id = %task.id, next = %next, "task scheduled");
                    next_entries.insert(
                        task.id.clone(),
                        Entry {
                            expression: expression.to_string(),
                            next,
                        },
                    );
                }
                Err(e) => {
                    tracing::debug!(task_id = %task.id, error = %e, "task schedule unusable, not scheduling");
                }
            }
        }

        *entries = next_entries;
    }

    /// Trigger every entry whose instant has arrived, then reschedule it.
    ///
    /// An instant far in the past (host sleep, clock jump) fires once only.
    async fn fire_due(&self, entries: &mut HashMap<TaskId, Entry>) {
        let now = Local::now();
        let due: Vec<TaskId> = entries
            .iter()
            .filter(|(_, entry)| entry.next <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in due {
            match self
                .coordinator
                .trigger(&task_id, TriggerReason::Scheduled)
                .await
            {
                Ok(run_id) => {
                    tracing::info!(task_id = %task_id, run_id = %run_id, "scheduled run triggered")
                }
                Err(RunError::AlreadyRunning(_)) => {
                    tracing::debug!(task_id = %task_id, "previous run still active, skipping trigger")
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "scheduled trigger failed")
                }
            }

            let Some(entry) = entries.get_mut(&task_id) else {
                continue;
            };
            match next_trigger(&entry.expression, Local::now().max(now)) {
                Ok(next) => entry.next = next,
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "no further occurrences");
                    entries.remove(&task_id);
                }
            }
        }
    }
}

fn snapshot(entries: &HashMap<TaskId, Entry>) -> Vec<NextTrigger> {
    let mut triggers: Vec<_> = entries
        .iter()
        .map(|(task_id, entry)| NextTrigger {
            task_id: task_id.clone(),
            expression: entry.expression.clone(),
            at: entry.next,
        })
        .collect();
    triggers.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.task_id.cmp(&b.task_id)));
    triggers
}
