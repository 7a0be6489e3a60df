//! Run pipeline
//!
//! Wires the session pool, rate limiter, cache, circuit breaker, result
//! collector and result storage together from an [`AppConfig`]. One
//! pipeline serves many runs; every run gets a fresh pool and collector.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{DiskCache, TieredCache};
use crate::config::AppConfig;
use crate::executor::{CircuitBreaker, RateLimiter, RetryPolicy, TaskDistributor};
use crate::models::{RunSummary, ScheduleConfig, Task};
use crate::results::{generate_run_id, ResultCollector, ResultsStorage};
use crate::scheduler::{DistributedCoordinator, RunTarget, WorkerTransport};
use crate::session::{HttpSessionFactory, SessionFactory, SessionPool};
use crate::utils::Timer;

const CREATE_BACKOFF: Duration = Duration::from_millis(500);

/// Per-run overrides of the configured execution settings
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub concurrency: Option<usize>,
    pub policy: Option<RetryPolicy>,
    /// Persist outcomes through [`ResultsStorage`]
    pub save: bool,
}

/// Remote workers a scheduled run is partitioned across
struct Remote {
    coordinator: Arc<DistributedCoordinator>,
    transport: Arc<dyn WorkerTransport>,
}

pub struct Pipeline<F: SessionFactory + Clone> {
    config: AppConfig,
    factory: F,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<TieredCache>>,
    breaker: Option<Arc<CircuitBreaker>>,
    storage: ResultsStorage,
    remote: Option<Remote>,
    cancel: CancellationToken,
}

impl Pipeline<HttpSessionFactory> {
    /// HTTP sessions configured from `execution`
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let mut factory = HttpSessionFactory::new(config.execution.request_timeout_secs);
        if let Some(url) = &config.execution.base_url {
            factory = factory.base_url(url.clone());
        }
        Self::new(factory, config)
    }
}

impl<F: SessionFactory + Clone> Pipeline<F> {
    pub fn new(factory: F, config: AppConfig) -> Result<Self> {
        config.validate()?;

        let limiter = match config.execution.rate_limit_per_minute {
            0 => RateLimiter::unlimited(),
            n => RateLimiter::per_minute(n),
        };

        let cache = if config.cache.enabled {
            let mut cache = TieredCache::new(
                config.cache.max_entries,
                Duration::from_secs(config.cache.ttl_secs),
            );
            if let Some(dir) = &config.cache.disk_dir {
                let disk = DiskCache::new(dir, Duration::from_secs(config.cache.ttl_secs))
                    .context("Failed to open disk cache")?;
                cache = cache.with_disk(disk);
            }
            Some(Arc::new(cache))
        } else {
            None
        };

        let breaker = config.circuit_breaker.as_ref().map(|cb| {
            Arc::new(CircuitBreaker::new(
                "pipeline",
                cb.failure_threshold,
                Duration::from_secs(cb.recovery_timeout_secs),
            ))
        });

        Ok(Self {
            storage: config.results.storage(),
            config,
            factory,
            limiter: Arc::new(limiter),
            cache,
            breaker,
            remote: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_storage(mut self, storage: ResultsStorage) -> Self {
        self.storage = storage;
        self
    }

    /// Partition scheduled runs across remote workers
    pub fn with_remote(
        mut self,
        coordinator: Arc<DistributedCoordinator>,
        transport: Arc<dyn WorkerTransport>,
    ) -> Self {
        self.remote = Some(Remote {
            coordinator,
            transport,
        });
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storage(&self) -> &ResultsStorage {
        &self.storage
    }

    pub fn cache(&self) -> Option<&Arc<TieredCache>> {
        self.cache.as_ref()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every run in progress
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Background TTL sweep of the memory tier, stopped by [`cancel`](Self::cancel)
    pub fn spawn_cache_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        self.cache
            .as_ref()
            .map(|cache| cache.spawn_sweeper(interval, self.cancel.clone()))
    }

    /// Execute one batch.
    ///
    /// With `save`, whatever reached the collector is flushed even when the
    /// run itself was aborted.
    pub async fn run_tasks(
        &self,
        tasks: Vec<Task>,
        target: &str,
        options: &RunOptions,
        cancel: Option<CancellationToken>,
    ) -> Result<RunSummary> {
        let exec = &self.config.execution;
        let concurrency = options.concurrency.unwrap_or(exec.concurrency);
        let policy = options.policy.unwrap_or_else(|| exec.retry_policy());

        let pool = SessionPool::new(self.factory.clone(), concurrency)
            .with_create_retries(exec.session_create_retries, CREATE_BACKOFF);
        let collector = Arc::new(ResultCollector::new());
        let run_cancel = cancel.unwrap_or_else(|| self.cancel.child_token());

        let mut distributor = TaskDistributor::new(pool.clone())
            .with_rate_limiter(self.limiter.clone())
            .with_collector(collector.clone())
            .with_cancellation(run_cancel);
        if let Some(cache) = &self.cache {
            distributor = distributor.with_cache(cache.clone());
        }
        if let Some(breaker) = &self.breaker {
            distributor = distributor.with_circuit_breaker(breaker.clone());
        }

        let run_id = generate_run_id();
        let result = distributor
            .run_with_id(run_id.clone(), tasks, concurrency, policy)
            .await;
        pool.close().await;

        if options.save && !collector.is_empty() {
            let timer = Timer::start(format!("flush {run_id}"));
            let mut sink = self.storage.sink(&run_id, target);
            collector
                .flush(&mut sink)
                .await
                .context("Failed to persist run results")?;
            timer.stop();
        }

        let summary = result.with_context(|| format!("Run {run_id} for {target} aborted"))?;
        if summary.skipped > 0 {
            warn!("Run for {}: {} task(s) skipped", target, summary.skipped);
        }
        Ok(summary)
    }

    /// Load the target's task file and run it
    pub async fn run_file(
        &self,
        path: impl AsRef<Path>,
        options: &RunOptions,
        cancel: Option<CancellationToken>,
    ) -> Result<RunSummary> {
        let path = path.as_ref();
        let tasks = load_tasks(path)?;
        self.run_tasks(tasks, &path.display().to_string(), options, cancel)
            .await
    }
}

#[async_trait]
impl<F: SessionFactory + Clone> RunTarget for Pipeline<F> {
    async fn run(&self, schedule: &ScheduleConfig, cancel: CancellationToken) -> Result<RunSummary> {
        let mut tasks = load_tasks(&schedule.target)?;
        let options = RunOptions {
            save: true,
            ..RunOptions::default()
        };

        if let Some(remote) = &self.remote {
            if !remote.coordinator.workers_for(&schedule.target).is_empty() {
                let plan = remote.coordinator.plan(
                    &tasks,
                    &schedule.target,
                    schedule.worker_assignment.as_ref(),
                );
                let report = remote
                    .coordinator
                    .dispatch_plan(plan, &schedule.target, remote.transport.as_ref())
                    .await;
                info!(
                    "Schedule '{}': {} task(s) sent to {} worker(s), {} kept local",
                    schedule.name,
                    report.total() - report.local.len(),
                    report.assigned.len(),
                    report.local.len()
                );
                tasks = report.local;
            }
        }

        self.run_tasks(tasks, &schedule.target, &options, Some(cancel))
            .await
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Document { tasks: Vec<Task> },
}

/// Read a task list from YAML (`.yaml`/`.yml`) or JSON.
///
/// Accepts either a bare list or a document with a `tasks` key.
pub fn load_tasks(path: impl AsRef<Path>) -> Result<Vec<Task>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;

    let is_yaml = path
        .extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false);

    let file: TaskFile = if is_yaml {
        serde_yaml::from_str(&content).context("Failed to parse YAML task file")?
    } else {
        serde_json::from_str(&content).context("Failed to parse JSON task file")?
    };

    Ok(match file {
        TaskFile::List(tasks) => tasks,
        TaskFile::Document { tasks } => tasks,
    })
}
