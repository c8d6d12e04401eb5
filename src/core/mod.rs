//! Core domain types: identifiers, task definitions and cron schedules.

pub mod schedule;
pub mod task;
pub mod types;
