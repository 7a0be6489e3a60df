//! Outcome models
//!
//! Defines terminal task outcomes and run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Skipped,
}

impl OutcomeStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "✓",
            OutcomeStatus::Failed => "✗",
            OutcomeStatus::Skipped => "○",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Success)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "SUCCESS"),
            OutcomeStatus::Failed => write!(f, "FAILED"),
            OutcomeStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Terminal result of executing one task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub task_id: String,
    pub category: String,
    pub status: OutcomeStatus,
    /// Session result on success
    pub value: Option<serde_json::Value>,
    /// Last error on failure, reason on skip
    pub error: Option<String>,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Served from the cache layer without a live call
    #[serde(default)]
    pub cached: bool,
}

impl Outcome {
    pub fn success(
        task_id: impl Into<String>,
        value: serde_json::Value,
        attempt_count: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            category: String::new(),
            status: OutcomeStatus::Success,
            value: Some(value),
            error: None,
            attempt_count,
            started_at,
            finished_at: Utc::now(),
            cached: false,
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        error: impl Into<String>,
        attempt_count: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            category: String::new(),
            status: OutcomeStatus::Failed,
            value: None,
            error: Some(error.into()),
            attempt_count,
            started_at,
            finished_at: Utc::now(),
            cached: false,
        }
    }

    pub fn skipped(
        task_id: impl Into<String>,
        reason: impl Into<String>,
        attempt_count: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            category: String::new(),
            status: OutcomeStatus::Skipped,
            value: None,
            error: Some(reason.into()),
            attempt_count,
            started_at,
            finished_at: Utc::now(),
            cached: false,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn from_cache(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms, {} attempt(s)]",
            self.status.symbol(),
            self.task_id,
            self.duration_ms(),
            self.attempt_count
        )?;
        if self.cached {
            write!(f, " (cached)")?;
        }
        if let Some(err) = &self.error {
            write!(f, " - {err}")?;
        }
        Ok(())
    }
}

/// What one distributor worker did during a run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker: usize,
    /// Tasks this worker brought to a terminal outcome
    pub tasks_completed: usize,
    /// Live session calls, retries included
    pub attempts: u32,
    /// Task in flight, `None` when idle
    pub current_task: Option<String>,
}

/// Timing aggregates over tasks that made at least one live call
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    pub fn from_outcomes(outcomes: &[Outcome]) -> Option<Self> {
        let durations: Vec<u64> = outcomes
            .iter()
            .filter(|o| o.attempt_count > 0)
            .map(Outcome::duration_ms)
            .collect();

        let min_ms = *durations.iter().min()?;
        let max_ms = *durations.iter().max()?;
        let avg_ms = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
        Some(Self {
            avg_ms,
            min_ms,
            max_ms,
        })
    }
}

/// Summary of one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_attempts: u32,
    /// Attempts beyond the first, summed over tasks
    #[serde(default)]
    pub total_retries: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub durations: Option<DurationStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerStats>,
    pub outcomes: Vec<Outcome>,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, outcomes: Vec<Outcome>, duration_ms: u64) -> Self {
        let count = |status: OutcomeStatus| outcomes.iter().filter(|o| o.status == status).count();

        Self {
            run_id: run_id.into(),
            total: outcomes.len(),
            succeeded: count(OutcomeStatus::Success),
            failed: count(OutcomeStatus::Failed),
            skipped: count(OutcomeStatus::Skipped),
            total_attempts: outcomes.iter().map(|o| o.attempt_count).sum(),
            total_retries: outcomes
                .iter()
                .map(|o| o.attempt_count.saturating_sub(1))
                .sum(),
            duration_ms,
            durations: DurationStats::from_outcomes(&outcomes),
            workers: Vec::new(),
            outcomes,
        }
    }

    pub fn with_workers(mut self, workers: Vec<WorkerStats>) -> Self {
        self.workers = workers;
        self
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.succeeded as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }

    pub fn get(&self, task_id: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.task_id == task_id)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for outcome in &self.outcomes {
            writeln!(f, "  {outcome}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Success: {} | Failed: {} | Skipped: {} | Attempts: {}",
            self.total, self.succeeded, self.failed, self.skipped, self.total_attempts
        )?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms | Retries: {}",
            self.pass_rate(),
            self.duration_ms,
            self.total_retries
        )?;
        if let Some(d) = &self.durations {
            writeln!(
                f,
                "Task Time: avg {:.0}ms | min {}ms | max {}ms",
                d.avg_ms, d.min_ms, d.max_ms
            )?;
        }
        for w in &self.workers {
            writeln!(
                f,
                "  Worker {}: {} task(s), {} attempt(s)",
                w.worker, w.tasks_completed, w.attempts
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_creation() {
        let outcome = Outcome::success("t1", json!({"ok": true}), 1, Utc::now());
        assert!(outcome.status.is_success());
        assert_eq!(outcome.attempt_count, 1);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_run_summary() {
        let now = Utc::now();
        let outcomes = vec![
            Outcome::success("t1", json!(1), 1, now),
            Outcome::failed("t2", "boom", 3, now),
            Outcome::skipped("t3", "cancelled", 0, now),
        ];

        let summary = RunSummary::new("run", outcomes, 10);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total_attempts, 4);
        assert!(!summary.is_all_succeeded());
        assert_eq!(summary.get("t2").map(|o| o.status), Some(OutcomeStatus::Failed));
    }

    #[test]
    fn test_pass_rate_empty() {
        let summary = RunSummary::new("run", Vec::new(), 0);
        assert_eq!(summary.pass_rate(), 0.0);
        assert_eq!(summary.total_retries, 0);
        assert!(summary.durations.is_none());
    }

    fn timed(outcome: Outcome, start: DateTime<Utc>, ms: i64) -> Outcome {
        Outcome {
            started_at: start,
            finished_at: start + chrono::Duration::milliseconds(ms),
            ..outcome
        }
    }

    #[test]
    fn test_duration_stats_and_retries() {
        let now = Utc::now();
        let outcomes = vec![
            timed(Outcome::success("t1", json!(1), 1, now), now, 100),
            timed(Outcome::success("t2", json!(2), 3, now), now, 300),
            timed(Outcome::failed("t3", "boom", 2, now), now, 200),
            // Cache hits and skips made no live call
            timed(Outcome::success("t4", json!(4), 0, now).from_cache(), now, 1),
            timed(Outcome::skipped("t5", "cancelled", 0, now), now, 5000),
        ];

        let summary = RunSummary::new("run", outcomes, 700);
        assert_eq!(summary.total_retries, 3);
        let d = summary.durations.unwrap();
        assert_eq!(d.min_ms, 100);
        assert_eq!(d.max_ms, 300);
        assert_eq!(d.avg_ms, 200.0);

        let text = summary.to_string();
        assert!(text.contains("Retries: 3"));
        assert!(text.contains("avg 200ms | min 100ms | max 300ms"));
    }

    #[test]
    fn test_worker_stats_displayed() {
        let summary = RunSummary::new("run", Vec::new(), 0).with_workers(vec![WorkerStats {
            worker: 1,
            tasks_completed: 4,
            attempts: 5,
            current_task: None,
        }]);
        assert!(summary.to_string().contains("Worker 1: 4 task(s), 5 attempt(s)"));
    }
}
