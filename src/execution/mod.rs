//! Task execution engine.
//!
//! This module provides the execution infrastructure for running tasks:
//! spawning shell processes with streamed output, and coordinating runs so
//! that each task has at most one live execution.

mod coordinator;
mod decode;
mod process;

pub use coordinator::{
    DEFAULT_MAX_BUFFER_BYTES, RunCoordinator, RunError, RunInfo, RunLimits, TriggerReason,
};
pub use process::{
    DEFAULT_STOP_GRACE, ExecError, ExitOutcome, OutputChunk, ProcessExecutor, ProcessKiller,
    RunningProcess, Shell,
};
