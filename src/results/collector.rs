//! Result collector
//!
//! Thread-safe accumulation of terminal outcomes, keyed by task id, with an
//! idempotent batch flush to a persistence sink.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::models::{Outcome, RunSummary};

/// Persistence collaborator receiving the final batch.
///
/// Writes must upsert by `task_id` so that a retried flush does not
/// duplicate rows. Only the collector calls it, one flush at a time.
#[async_trait]
pub trait ResultSink: Send {
    async fn write_batch(&mut self, outcomes: &[Outcome]) -> Result<()>;
}

#[derive(Default)]
struct CollectorState {
    outcomes: HashMap<String, Outcome>,
    /// Bumped on every record
    version: u64,
}

/// Last-write-wins outcome map shared by all workers of a run
#[derive(Default)]
pub struct ResultCollector {
    state: Mutex<CollectorState>,
    /// Version last handed to a sink; also serializes flushes
    flushed: tokio::sync::Mutex<Option<u64>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upsert by task id
    pub fn record(&self, outcome: Outcome) {
        let mut state = self.state();
        state.version += 1;
        if let Some(previous) = state.outcomes.insert(outcome.task_id.clone(), outcome) {
            debug!("Replaced outcome for {}", previous.task_id);
        }
    }

    /// Snapshot ordered by task id
    pub fn all(&self) -> Vec<Outcome> {
        let mut outcomes: Vec<Outcome> = self.state().outcomes.values().cloned().collect();
        outcomes.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        outcomes
    }

    pub fn get(&self, task_id: &str) -> Option<Outcome> {
        self.state().outcomes.get(task_id).cloned()
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.state().outcomes.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.state().outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self, run_id: &str, duration_ms: u64) -> RunSummary {
        RunSummary::new(run_id, self.all(), duration_ms)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.outcomes.clear();
        state.version += 1;
    }

    /// Hand the full snapshot to `sink`.
    ///
    /// Returns `false` without touching the sink when nothing was recorded
    /// since the last successful flush. A failed write leaves the watermark
    /// untouched, so the next call retries it.
    pub async fn flush(&self, sink: &mut dyn ResultSink) -> Result<bool> {
        let mut flushed = self.flushed.lock().await;

        let (version, outcomes) = {
            let state = self.state();
            let mut outcomes: Vec<Outcome> = state.outcomes.values().cloned().collect();
            outcomes.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            (state.version, outcomes)
        };

        if *flushed == Some(version) {
            debug!("Flush skipped, nothing recorded since version {}", version);
            return Ok(false);
        }

        sink.write_batch(&outcomes).await?;
        *flushed = Some(version);
        info!("Flushed {} outcome(s)", outcomes.len());
        Ok(true)
    }
}

/// In-memory upserting sink
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: HashMap<String, Outcome>,
    pub write_calls: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn write_batch(&mut self, outcomes: &[Outcome]) -> Result<()> {
        self.write_calls += 1;
        for outcome in outcomes {
            self.rows.insert(outcome.task_id.clone(), outcome.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutcomeStatus;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    struct FailingSink;

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn write_batch(&mut self, _outcomes: &[Outcome]) -> Result<()> {
            anyhow::bail!("backend offline")
        }
    }

    #[test]
    fn test_record_is_upsert() {
        let collector = ResultCollector::new();
        collector.record(Outcome::failed("t1", "boom", 1, Utc::now()));
        collector.record(Outcome::success("t1", json!(1), 2, Utc::now()));

        assert_eq!(collector.len(), 1);
        let outcome = collector.get("t1").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.attempt_count, 2);
        assert!(collector.is_completed("t1"));
        assert!(!collector.is_completed("t2"));
    }

    #[tokio::test]
    async fn test_concurrent_record() {
        let collector = Arc::new(ResultCollector::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    collector.record(Outcome::success(
                        format!("t{}", (worker * 50 + i) % 100),
                        json!(i),
                        1,
                        Utc::now(),
                    ));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(collector.len(), 100);
    }

    #[tokio::test]
    async fn test_flush_twice_writes_once() {
        let collector = ResultCollector::new();
        collector.record(Outcome::success("t1", json!(1), 1, Utc::now()));
        collector.record(Outcome::success("t2", json!(2), 1, Utc::now()));

        let mut sink = MemorySink::new();
        assert!(collector.flush(&mut sink).await.unwrap());
        assert!(!collector.flush(&mut sink).await.unwrap());
        assert_eq!(sink.write_calls, 1);
        assert_eq!(sink.rows.len(), 2);

        collector.record(Outcome::failed("t3", "late", 1, Utc::now()));
        assert!(collector.flush(&mut sink).await.unwrap());
        assert_eq!(sink.write_calls, 2);
        assert_eq!(sink.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let collector = ResultCollector::new();
        collector.record(Outcome::success("t1", json!(1), 1, Utc::now()));

        assert!(collector.flush(&mut FailingSink).await.is_err());

        let mut sink = MemorySink::new();
        assert!(collector.flush(&mut sink).await.unwrap());
        assert_eq!(sink.rows.len(), 1);
    }

    #[test]
    fn test_summary_and_clear() {
        let collector = ResultCollector::new();
        collector.record(Outcome::success("a", json!(1), 1, Utc::now()));
        collector.record(Outcome::skipped("b", "cancelled", 0, Utc::now()));

        let summary = collector.summary("run-1", 5);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.skipped, 1);

        collector.clear();
        assert!(collector.is_empty());
    }
}
