//! Concurrent test batch execution engine
//!
//! A run takes an ordered list of [`models::Task`]s and a concurrency degree,
//! checks sessions out of a bounded [`session::SessionPool`], executes each
//! task under a shared [`executor::RateLimiter`] with per-task retries, serves
//! idempotent lookups from a [`cache::TieredCache`], and gathers exactly one
//! terminal [`models::Outcome`] per task in a [`results::ResultCollector`].
//!
//! [`scheduler::ScheduleCoordinator`] fires runs on recurring schedules and
//! [`scheduler::DistributedCoordinator`] partitions them across remote workers.

pub mod cache;
pub mod cli;
pub mod config;
pub mod executor;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod results;
pub mod scheduler;
pub mod session;
pub mod utils;

#[cfg(test)]
mod testing;
