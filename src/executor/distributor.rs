//! Task distributor
//!
//! Feeds a FIFO work queue to a fixed number of workers. Each worker checks
//! out a session per attempt, consults the cache and the rate limiter, and
//! retries transient failures according to the run's [`RetryPolicy`].

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CircuitBreaker, ExecError, RateLimiter, RetryPolicy, RunError};
use crate::cache::TieredCache;
use crate::models::{Outcome, RunSummary, Task, WorkerStats};
use crate::results::{generate_run_id, ResultCollector};
use crate::session::{Session, SessionFactory, SessionPool};
use crate::utils::Timer;

type Queue = Arc<Mutex<VecDeque<Arc<Task>>>>;

/// Task ids that reached a terminal outcome in the current run
type Settled = Arc<Mutex<HashSet<String>>>;

type Board = Arc<Mutex<Vec<WorkerStats>>>;

/// Runs task batches through a session pool
pub struct TaskDistributor<F: SessionFactory> {
    pool: SessionPool<F>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<TieredCache>>,
    breaker: Option<Arc<CircuitBreaker>>,
    collector: Arc<ResultCollector>,
    board: Board,
    cancel: CancellationToken,
}

impl<F: SessionFactory> TaskDistributor<F> {
    pub fn new(pool: SessionPool<F>) -> Self {
        Self {
            pool,
            limiter: Arc::new(RateLimiter::unlimited()),
            cache: None,
            breaker: None,
            collector: Arc::new(ResultCollector::new()),
            board: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_collector(mut self, collector: Arc<ResultCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// Tie runs to an externally owned shutdown signal
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pool(&self) -> &SessionPool<F> {
        &self.pool
    }

    pub fn collector(&self) -> &Arc<ResultCollector> {
        &self.collector
    }

    /// Per-worker progress of the current or most recent run
    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        lock(&self.board).clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative shutdown of the current run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Execute `tasks` with `concurrency` workers.
    ///
    /// Returns after every task has a terminal outcome in the collector.
    /// Cancellation yields a summary whose unfinished tasks are `Skipped`;
    /// a pool that cannot provision sessions aborts the run with
    /// `ResourceUnavailable` after the same bookkeeping. May be called
    /// repeatedly; outcomes left in the collector by earlier runs never
    /// stand in for this run's.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        concurrency: usize,
        policy: RetryPolicy,
    ) -> Result<RunSummary, RunError> {
        self.run_with_id(generate_run_id(), tasks, concurrency, policy)
            .await
    }

    /// [`run`](Self::run) under a caller-chosen run id
    pub async fn run_with_id(
        &self,
        run_id: String,
        tasks: Vec<Task>,
        concurrency: usize,
        policy: RetryPolicy,
    ) -> Result<RunSummary, RunError> {
        if concurrency == 0 {
            return Err(RunError::InvalidConcurrency(concurrency));
        }

        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(RunError::DuplicateTask(task.id.clone()));
            }
        }

        let timer = Timer::start(format!("run {run_id}"));
        let tasks: Vec<Arc<Task>> = tasks.into_iter().map(Arc::new).collect();
        let workers = concurrency.min(tasks.len());

        info!(
            "Run {}: {} task(s), {} worker(s), retry {} x{}",
            run_id,
            tasks.len(),
            workers,
            policy.strategy,
            policy.max_attempts
        );

        let queue: Queue = Arc::new(Mutex::new(tasks.iter().cloned().collect()));
        let run_cancel = self.cancel.child_token();
        let abort: Arc<Mutex<Option<RunError>>> = Arc::new(Mutex::new(None));
        let settled: Settled = Arc::new(Mutex::new(HashSet::with_capacity(tasks.len())));
        *lock(&self.board) = (0..workers)
            .map(|worker| WorkerStats {
                worker,
                ..WorkerStats::default()
            })
            .collect();

        let handles: Vec<_> = (0..workers)
            .map(|index| {
                let worker = Worker {
                    index,
                    pool: self.pool.clone(),
                    limiter: self.limiter.clone(),
                    cache: self.cache.clone(),
                    breaker: self.breaker.clone(),
                    collector: self.collector.clone(),
                    settled: settled.clone(),
                    board: self.board.clone(),
                    cancel: run_cancel.clone(),
                    abort: abort.clone(),
                    policy,
                };
                let queue = queue.clone();
                tokio::spawn(worker.run(queue))
            })
            .collect();

        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!("Worker {} terminated abnormally: {}", index, e);
            }
        }

        let aborted = lock(&abort).take();
        self.settle_unfinished(&tasks, &settled, aborted.as_ref());

        let outcomes: Vec<Outcome> = tasks
            .iter()
            .filter_map(|task| self.collector.get(&task.id))
            .collect();
        let duration_ms = timer.stop().as_millis() as u64;
        let summary =
            RunSummary::new(run_id, outcomes, duration_ms).with_workers(self.worker_stats());

        if let Some(err) = aborted {
            error!("Run {} aborted: {}", summary.run_id, err);
            return Err(err);
        }

        if summary.skipped > 0 && self.cancel.is_cancelled() {
            warn!(
                "Run {} cancelled, {} task(s) skipped",
                summary.run_id, summary.skipped
            );
        }
        info!(
            "Run {} completed in {}ms: {}/{} succeeded ({:.1}%)",
            summary.run_id,
            summary.duration_ms,
            summary.succeeded,
            summary.total,
            summary.pass_rate()
        );

        Ok(summary)
    }

    /// Give every task without an outcome a terminal one
    fn settle_unfinished(
        &self,
        tasks: &[Arc<Task>],
        settled: &Settled,
        aborted: Option<&RunError>,
    ) {
        let now = Utc::now();
        let settled = lock(settled);
        for task in tasks {
            if settled.contains(&task.id) {
                continue;
            }

            let outcome = if let Some(err) = aborted {
                Outcome::skipped(&task.id, format!("Run aborted: {err}"), 0, now)
            } else if self.cancel.is_cancelled() {
                Outcome::skipped(&task.id, "Cancelled before completion", 0, now)
            } else {
                Outcome::failed(&task.id, "Worker terminated abnormally", 0, now)
            };
            self.collector.record(outcome.with_category(&task.category));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One worker's view of the shared run state
struct Worker<F: SessionFactory> {
    index: usize,
    pool: SessionPool<F>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<TieredCache>>,
    breaker: Option<Arc<CircuitBreaker>>,
    collector: Arc<ResultCollector>,
    settled: Settled,
    board: Board,
    cancel: CancellationToken,
    abort: Arc<Mutex<Option<RunError>>>,
    policy: RetryPolicy,
}

impl<F: SessionFactory> Worker<F> {
    async fn run(self, queue: Queue) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = lock(&queue).pop_front();
            let Some(task) = next else {
                break;
            };
            self.update_stats(|stats| stats.current_task = Some(task.id.clone()));
            self.process(&task).await;
        }
        debug!("Worker {} finished", self.index);
    }

    fn update_stats(&self, update: impl FnOnce(&mut WorkerStats)) {
        if let Some(stats) = lock(&self.board).get_mut(self.index) {
            update(stats);
        }
    }

    fn record(&self, task: &Task, outcome: Outcome) {
        lock(&self.settled).insert(task.id.clone());
        self.collector.record(outcome.with_category(&task.category));
        self.update_stats(|stats| {
            stats.tasks_completed += 1;
            stats.current_task = None;
        });
    }

    fn skip(&self, task: &Task, attempts: u32, started_at: DateTime<Utc>, reason: &str) {
        debug!("Task {} skipped: {}", task.id, reason);
        self.record(task, Outcome::skipped(&task.id, reason, attempts, started_at));
    }

    /// Abort the whole run; the first error wins
    fn abort(&self, err: RunError) {
        let mut slot = lock(&self.abort);
        if slot.is_none() {
            *slot = Some(err);
        }
        self.cancel.cancel();
    }

    async fn process(&self, task: &Task) {
        let started_at = Utc::now();

        let cache_key = task.cache_key();
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(value) = cache.fetch(key).await {
                debug!("Task {} served from cache", task.id);
                self.record(task, Outcome::success(&task.id, value, 0, started_at).from_cache());
                return;
            }
        }

        let mut attempts = 0u32;
        loop {
            if let Some(breaker) = &self.breaker {
                if breaker.wait_ready(&self.cancel).await.is_err() {
                    return self.skip(task, attempts, started_at, "Cancelled while circuit open");
                }
            }

            let mut session = match self.pool.acquire(&self.cancel).await {
                Ok(session) => session,
                Err(RunError::Cancelled) => {
                    return self.skip(task, attempts, started_at, "Cancelled while waiting for a session");
                }
                Err(err) => {
                    self.abort(err);
                    return self.skip(task, attempts, started_at, "Run aborted");
                }
            };

            if self.limiter.wait(&self.cancel).await.is_err() {
                session.release(true).await;
                return self.skip(task, attempts, started_at, "Cancelled while rate limited");
            }

            attempts += 1;
            self.update_stats(|stats| stats.attempts += 1);
            debug!(
                "Worker {} executing {} (attempt {}/{})",
                self.index, task.id, attempts, self.policy.max_attempts
            );

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = session.execute(task) => Some(result),
            };

            let err = match result {
                None => {
                    // Interrupted mid-call, state of the session is unknown
                    session.release(false).await;
                    return self.skip(task, attempts, started_at, "Cancelled during execution");
                }
                Some(Ok(value)) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    session.release(true).await;
                    if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                        cache.store(key, value.clone(), None).await;
                    }
                    self.record(task, Outcome::success(&task.id, value, attempts, started_at));
                    return;
                }
                Some(Err(err)) => err,
            };

            if let Some(breaker) = &self.breaker {
                // A permanent rejection still means the service answered
                match err {
                    ExecError::Fatal(_) => breaker.record_success(),
                    _ => breaker.record_failure(),
                }
            }
            let healthy = !matches!(err, ExecError::SessionCorrupted(_));
            session.release(healthy).await;

            if !err.is_retryable() || !self.policy.attempts_remaining(attempts) {
                warn!("Task {} failed after {} attempt(s): {}", task.id, attempts, err);
                self.record(task, Outcome::failed(&task.id, err.to_string(), attempts, started_at));
                return;
            }

            let delay = self.policy.delay_for(attempts);
            warn!(
                "Task {} attempt {}/{} failed: {}, retrying in {}ms",
                task.id,
                attempts,
                self.policy.max_attempts,
                err,
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.skip(task, attempts, started_at, "Cancelled during retry backoff");
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RetryStrategy;
    use crate::models::OutcomeStatus;
    use crate::testing::FakeFactory;
    use serde_json::json;
    use std::time::Duration;

    fn tasks(n: usize) -> Vec<Task> {
        (0..n).map(|i| Task::new(format!("t{i:02}"), json!({ "n": i }))).collect()
    }

    fn exponential(base_ms: u64, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryStrategy::Exponential, attempts, Duration::from_millis(base_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_outcome_per_task() {
        for (m, n) in [(1, 1), (7, 3), (12, 5), (5, 5)] {
            let factory = FakeFactory::ok().with_delay(Duration::from_millis(10));
            let distributor = TaskDistributor::new(SessionPool::new(factory, n));

            let summary = distributor.run(tasks(m), n, RetryPolicy::default()).await.unwrap();
            assert_eq!(summary.total, m);
            assert_eq!(summary.succeeded, m);
            let ids: HashSet<_> = summary.outcomes.iter().map(|o| o.task_id.clone()).collect();
            assert_eq!(ids.len(), m);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_concurrency() {
        let factory = FakeFactory::ok().with_delay(Duration::from_millis(50));
        let tally = factory.tally();
        let distributor = TaskDistributor::new(SessionPool::new(factory, 3));

        distributor.run(tasks(20), 3, RetryPolicy::none()).await.unwrap();
        assert_eq!(tally.max_active(), 3);
        assert!(tally.created() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_smaller_than_concurrency_still_bounded() {
        let factory = FakeFactory::ok().with_delay(Duration::from_millis(50));
        let tally = factory.tally();
        let distributor = TaskDistributor::new(SessionPool::new(factory, 2));

        let summary = distributor.run(tasks(10), 5, RetryPolicy::none()).await.unwrap();
        assert_eq!(summary.succeeded, 10);
        assert!(tally.max_active() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategy_none_single_attempt() {
        let factory = FakeFactory::new(|_, _| Err(ExecError::transient("timeout")));
        let tally = factory.tally();
        let distributor = TaskDistributor::new(SessionPool::new(factory, 2));

        let policy = RetryPolicy::new(RetryStrategy::None, 5, Duration::from_millis(100));
        let summary = distributor.run(tasks(4), 2, policy).await.unwrap();

        assert_eq!(summary.failed, 4);
        assert!(summary.outcomes.iter().all(|o| o.attempt_count == 1));
        assert_eq!(tally.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_timing() {
        let factory = FakeFactory::new(|_, _| Err(ExecError::transient("throttled")));
        let tally = factory.tally();
        let distributor = TaskDistributor::new(SessionPool::new(factory, 1));

        let summary = distributor
            .run(vec![Task::new("flaky", json!({}))], 1, exponential(100, 3))
            .await
            .unwrap();

        let outcome = summary.get("flaky").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.attempt_count, 3);

        let spans = tally.spans("flaky");
        assert_eq!(spans.len(), 3);
        assert!(spans[1].0 - spans[0].1 >= Duration::from_millis(100));
        assert!(spans[2].0 - spans[1].1 >= Duration::from_millis(200));
        assert!(spans[2].0 - spans[0].1 >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let factory = FakeFactory::new(|task, attempt| {
            if attempt < 2 {
                Err(ExecError::transient("reset"))
            } else {
                Ok(json!({ "task": task.id }))
            }
        });
        let distributor = TaskDistributor::new(SessionPool::new(factory, 2));

        let summary = distributor.run(tasks(3), 2, exponential(10, 3)).await.unwrap();
        assert!(summary.is_all_succeeded());
        assert!(summary.outcomes.iter().all(|o| o.attempt_count == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_not_retried() {
        let factory = FakeFactory::new(|_, _| Err(ExecError::fatal("malformed")));
        let tally = factory.tally();
        let distributor = TaskDistributor::new(SessionPool::new(factory, 1));

        let summary = distributor.run(tasks(2), 1, exponential(10, 5)).await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(tally.calls(), 2);
        assert!(summary.outcomes[0].error.as_deref().unwrap().contains("malformed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_session_replaced() {
        let factory = FakeFactory::new(|_, attempt| {
            if attempt == 1 {
                Err(ExecError::corrupted("page crashed"))
            } else {
                Ok(json!("ok"))
            }
        });
        let tally = factory.tally();
        let pool = SessionPool::new(factory, 1);
        let distributor = TaskDistributor::new(pool.clone());

        let summary = distributor
            .run(vec![Task::new("t", json!({}))], 1, exponential(10, 3))
            .await
            .unwrap();

        assert!(summary.is_all_succeeded());
        assert_eq!(tally.created(), 2);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_skips_unfinished_and_frees_pool() {
        let factory = FakeFactory::ok().with_delay(Duration::from_secs(10));
        let pool = SessionPool::new(factory, 2);
        let distributor = Arc::new(TaskDistributor::new(pool.clone()));

        let cancel = distributor.cancel_token();
        tokio::spawn(async move {
            sleep(Duration::from_secs(15)).await;
            cancel.cancel();
        });

        let summary = distributor.run(tasks(6), 2, RetryPolicy::none()).await.unwrap();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 4);
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let factory = FakeFactory::new(|_, _| Err(ExecError::transient("busy")));
        let distributor = TaskDistributor::new(SessionPool::new(factory, 1));

        let cancel = distributor.cancel_token();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let policy = RetryPolicy::new(RetryStrategy::Linear, 3, Duration::from_secs(60));
        let summary = distributor.run(tasks(1), 1, policy).await.unwrap();

        let outcome = &summary.outcomes[0];
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resource_unavailable_aborts_run() {
        let factory = FakeFactory::ok().failing_create();
        let distributor = TaskDistributor::new(
            SessionPool::new(factory, 2).with_create_retries(3, Duration::from_millis(10)),
        );

        let err = distributor.run(tasks(4), 2, RetryPolicy::none()).await.unwrap_err();
        assert!(matches!(err, RunError::ResourceUnavailable { attempts: 3, .. }));

        let collector = distributor.collector();
        assert_eq!(collector.len(), 4);
        assert!(collector.all().iter().all(|o| o.status == OutcomeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let distributor = TaskDistributor::new(SessionPool::new(FakeFactory::ok(), 1));

        let err = distributor.run(tasks(2), 0, RetryPolicy::none()).await.unwrap_err();
        assert_eq!(err, RunError::InvalidConcurrency(0));

        let dup = vec![Task::new("a", json!(1)), Task::new("a", json!(2))];
        let err = distributor.run(dup, 1, RetryPolicy::none()).await.unwrap_err();
        assert_eq!(err, RunError::DuplicateTask("a".to_string()));
    }

    #[tokio::test]
    async fn test_empty_run() {
        let distributor = TaskDistributor::new(SessionPool::new(FakeFactory::ok(), 1));
        let summary = distributor.run(Vec::new(), 3, RetryPolicy::none()).await.unwrap();
        assert_eq!(summary.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_dedupes_identical_requests() {
        let factory = FakeFactory::ok();
        let tally = factory.tally();
        let cache = Arc::new(TieredCache::new(100, Duration::from_secs(60)));
        let distributor =
            TaskDistributor::new(SessionPool::new(factory, 1)).with_cache(cache.clone());

        let batch = vec![
            Task::new("a", json!({ "q": "same" })).cacheable(),
            Task::new("b", json!({ "q": "same" })).cacheable(),
            Task::new("c", json!({ "q": "same" })),
        ];
        let summary = distributor.run(batch, 1, RetryPolicy::none()).await.unwrap();

        assert!(summary.is_all_succeeded());
        assert_eq!(tally.calls(), 2);
        let b = summary.get("b").unwrap();
        assert!(b.cached);
        assert_eq!(b.attempt_count, 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_applied_per_attempt() {
        let factory = FakeFactory::ok();
        let tally = factory.tally();
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(60)));
        let distributor =
            TaskDistributor::new(SessionPool::new(factory, 3)).with_rate_limiter(limiter);

        let start = tokio::time::Instant::now();
        distributor.run(tasks(4), 3, RetryPolicy::none()).await.unwrap();

        assert_eq!(tally.calls(), 4);
        // Calls 3 and 4 wait for the first window to roll over
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_pauses_workers() {
        let factory = FakeFactory::new(|_, attempt| {
            if attempt == 1 {
                Err(ExecError::transient("503"))
            } else {
                Ok(json!("recovered"))
            }
        });
        let tally = factory.tally();
        let breaker = Arc::new(CircuitBreaker::new("target", 1, Duration::from_secs(30)));
        let distributor = TaskDistributor::new(SessionPool::new(factory, 1))
            .with_circuit_breaker(breaker.clone());

        let policy = RetryPolicy::new(RetryStrategy::Linear, 3, Duration::from_millis(10));
        let summary = distributor.run(tasks(1), 1, policy).await.unwrap();

        assert!(summary.is_all_succeeded());
        let spans = tally.spans("t00");
        assert!(spans[1].0 - spans[0].1 >= Duration::from_secs(30));
        assert_eq!(breaker.state(), crate::executor::CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_distributor_ignores_earlier_outcomes() {
        let cancel = CancellationToken::new();
        let distributor = TaskDistributor::new(SessionPool::new(FakeFactory::ok(), 2))
            .with_cancellation(cancel.clone());
        let batch = || vec![Task::new("a", json!(1)), Task::new("b", json!(2))];

        let first = distributor.run(batch(), 2, RetryPolicy::none()).await.unwrap();
        assert_eq!(first.succeeded, 2);

        cancel.cancel();
        let second = distributor.run(batch(), 2, RetryPolicy::none()).await.unwrap();
        assert_eq!(second.total, 2);
        assert_eq!(second.skipped, 2);
        assert!(second.outcomes.iter().all(|o| o.status == OutcomeStatus::Skipped));
        assert_eq!(
            distributor.collector().get("a").map(|o| o.status),
            Some(OutcomeStatus::Skipped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stats_account_for_every_task() {
        let factory = FakeFactory::new(|_, attempt| {
            if attempt == 1 {
                Err(ExecError::transient("reset"))
            } else {
                Ok(json!("ok"))
            }
        })
        .with_delay(Duration::from_millis(20));
        let tally = factory.tally();
        let distributor = TaskDistributor::new(SessionPool::new(factory, 3));

        let summary = distributor.run(tasks(7), 3, exponential(10, 3)).await.unwrap();

        assert_eq!(summary.workers.len(), 3);
        let completed: usize = summary.workers.iter().map(|w| w.tasks_completed).sum();
        let attempts: u32 = summary.workers.iter().map(|w| w.attempts).sum();
        assert_eq!(completed, 7);
        assert_eq!(attempts, 14);
        assert_eq!(summary.total_retries, 7);
        assert!(summary.workers.iter().all(|w| w.current_task.is_none()));
        assert_eq!(tally.attempts("t03"), 2);
        assert_eq!(distributor.worker_stats(), summary.workers);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stats_show_task_in_flight() {
        let factory = FakeFactory::ok().with_delay(Duration::from_secs(10));
        let distributor = Arc::new(TaskDistributor::new(SessionPool::new(factory, 1)));

        let running = distributor.clone();
        let handle =
            tokio::spawn(async move { running.run(tasks(2), 1, RetryPolicy::none()).await });

        sleep(Duration::from_secs(1)).await;
        let live = distributor.worker_stats();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].current_task.as_deref(), Some("t00"));
        assert_eq!(live[0].tasks_completed, 0);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.workers[0].tasks_completed, 2);
    }

    #[tokio::test]
    async fn test_run_with_caller_id() {
        let distributor = TaskDistributor::new(SessionPool::new(FakeFactory::ok(), 1));
        let summary = distributor
            .run_with_id("nightly-42".to_string(), tasks(1), 1, RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(summary.run_id, "nightly-42");
    }
}
