//! Data models for batch execution
//!
//! This module contains all data structures shared across the pipeline.

mod outcome;
mod schedule;
mod task;

pub use outcome::{DurationStats, Outcome, OutcomeStatus, RunSummary, WorkerStats};
pub use schedule::{Recurrence, ScheduleConfig, WorkerInfo};
pub use task::Task;
