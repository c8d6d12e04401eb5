//! Scheduler loop for automatic task triggering.
//!
//! This module provides the background loop that triggers tasks at their
//! scheduled times and the handle used to control it.

mod engine;
mod handle;
mod types;

pub use engine::{DEFAULT_MAX_NAP, Scheduler};
pub use handle::SchedulerHandle;
pub use types::{NextTrigger, SchedulerError, SchedulerState};
