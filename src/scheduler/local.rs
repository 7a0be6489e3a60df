//! Local schedule coordinator
//!
//! Polls the schedule list on a fixed tick and fires every due schedule
//! through a [`RunTarget`]. A schedule moves Idle -> Due -> Running -> Idle;
//! `last_run` and `next_run` are updated and persisted after each firing.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ScheduleStore;
use crate::models::{RunSummary, ScheduleConfig};

const DEFAULT_TICK: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The pipeline a schedule fires
#[async_trait]
pub trait RunTarget: Send + Sync + 'static {
    async fn run(&self, schedule: &ScheduleConfig, cancel: CancellationToken) -> Result<RunSummary>;
}

/// Per-schedule lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Idle,
    Due,
    Running,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleState::Idle => write!(f, "idle"),
            ScheduleState::Due => write!(f, "due"),
            ScheduleState::Running => write!(f, "running"),
        }
    }
}

/// Snapshot returned by [`ScheduleCoordinator::status`]
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub current_job: Option<String>,
    pub start_time: Option<DateTime<Local>>,
    pub schedules_count: usize,
    pub enabled_count: usize,
}

struct Inner {
    target: Arc<dyn RunTarget>,
    store: Option<ScheduleStore>,
    tick: Mutex<Duration>,
    schedules: Mutex<Vec<ScheduleConfig>>,
    current_job: Mutex<Option<String>>,
    start_time: Mutex<Option<DateTime<Local>>>,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the schedule list and the polling loop
#[derive(Clone)]
pub struct ScheduleCoordinator {
    inner: Arc<Inner>,
}

impl ScheduleCoordinator {
    pub fn new(target: impl RunTarget) -> Self {
        Self::from_parts(Arc::new(target), None, Vec::new(), DEFAULT_TICK)
    }

    /// Load persisted schedules and write every change back
    pub fn with_store(target: impl RunTarget, store: ScheduleStore) -> Result<Self> {
        let schedules = store.load()?;
        info!(
            "Loaded {} schedule(s) from {}",
            schedules.len(),
            store.path().display()
        );
        Ok(Self::from_parts(Arc::new(target), Some(store), schedules, DEFAULT_TICK))
    }

    fn from_parts(
        target: Arc<dyn RunTarget>,
        store: Option<ScheduleStore>,
        schedules: Vec<ScheduleConfig>,
        tick: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                store,
                tick: Mutex::new(tick),
                schedules: Mutex::new(schedules),
                current_job: Mutex::new(None),
                start_time: Mutex::new(None),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Poll interval of the loop, shared by every clone; a running loop
    /// picks it up after its current sleep
    pub fn with_tick(self, tick: Duration) -> Self {
        *lock(&self.inner.tick) = tick;
        self
    }

    pub fn tick(&self) -> Duration {
        *lock(&self.inner.tick)
    }

    fn persist(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let schedules = lock(&self.inner.schedules).clone();
        if let Err(e) = store.save(&schedules) {
            warn!("Failed to save schedules: {:#}", e);
        }
    }

    /// Add or replace (by name) a schedule and compute its first run
    pub fn add_schedule(&self, config: ScheduleConfig) -> Result<()> {
        self.add_schedule_at(config, Local::now().naive_local())
    }

    fn add_schedule_at(&self, mut config: ScheduleConfig, now: NaiveDateTime) -> Result<()> {
        config.recurrence.validate()?;
        config.next_run = config.recurrence.next_after(now);

        {
            let mut schedules = lock(&self.inner.schedules);
            schedules.retain(|s| s.name != config.name);
            info!("Added schedule '{}' ({})", config.name, config.recurrence);
            schedules.push(config);
        }
        self.persist();
        Ok(())
    }

    pub fn remove_schedule(&self, name: &str) -> bool {
        let removed = {
            let mut schedules = lock(&self.inner.schedules);
            let before = schedules.len();
            schedules.retain(|s| s.name != name);
            schedules.len() < before
        };
        if removed {
            info!("Removed schedule '{}'", name);
            self.persist();
        }
        removed
    }

    pub fn list_schedules(&self) -> Vec<ScheduleConfig> {
        lock(&self.inner.schedules).clone()
    }

    pub fn state(&self, name: &str) -> Option<ScheduleState> {
        self.state_at(name, Local::now().naive_local())
    }

    fn state_at(&self, name: &str, now: NaiveDateTime) -> Option<ScheduleState> {
        if lock(&self.inner.current_job).as_deref() == Some(name) {
            return Some(ScheduleState::Running);
        }
        let schedules = lock(&self.inner.schedules);
        let schedule = schedules.iter().find(|s| s.name == name)?;
        Some(if schedule.is_due(now) {
            ScheduleState::Due
        } else {
            ScheduleState::Idle
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SchedulerStatus {
        let schedules = lock(&self.inner.schedules);
        SchedulerStatus {
            running: self.is_running(),
            current_job: lock(&self.inner.current_job).clone(),
            start_time: *lock(&self.inner.start_time),
            schedules_count: schedules.len(),
            enabled_count: schedules.iter().filter(|s| s.enabled).count(),
        }
    }

    /// Fire every schedule due at `now`, one after another.
    ///
    /// Returns how many schedules were fired.
    pub async fn tick_at(&self, now: NaiveDateTime) -> usize {
        let shutdown = lock(&self.inner.shutdown).clone();
        self.fire_due(now, &shutdown).await
    }

    async fn fire_due(&self, now: NaiveDateTime, shutdown: &CancellationToken) -> usize {
        let due: Vec<ScheduleConfig> = lock(&self.inner.schedules)
            .iter()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();

        let mut fired = 0;
        for schedule in due {
            if shutdown.is_cancelled() {
                break;
            }
            self.run_job(&schedule, now, shutdown).await;
            fired += 1;
        }
        fired
    }

    async fn run_job(&self, schedule: &ScheduleConfig, now: NaiveDateTime, shutdown: &CancellationToken) {
        *lock(&self.inner.current_job) = Some(schedule.name.clone());
        info!("Starting scheduled run '{}' -> {}", schedule.name, schedule.target);

        match self.inner.target.run(schedule, shutdown.child_token()).await {
            Ok(summary) => info!(
                "Scheduled run '{}' finished: {}/{} succeeded",
                schedule.name, summary.succeeded, summary.total
            ),
            Err(e) => error!("Scheduled run '{}' failed: {:#}", schedule.name, e),
        }

        {
            let mut schedules = lock(&self.inner.schedules);
            if let Some(entry) = schedules.iter_mut().find(|s| s.name == schedule.name) {
                entry.last_run = Some(now);
                entry.next_run = entry.recurrence.next_after(now);
            }
        }
        *lock(&self.inner.current_job) = None;
        self.persist();
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.inner.shutdown) = token.clone();
        *lock(&self.inner.start_time) = Some(Local::now());
        self.inner.running.store(true, Ordering::SeqCst);
        token
    }

    async fn run_loop(&self, shutdown: CancellationToken) {
        info!(
            "Scheduler started with {} schedule(s), tick {}s",
            lock(&self.inner.schedules).len(),
            self.tick().as_secs()
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.fire_due(Local::now().naive_local(), &shutdown).await;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(self.tick()) => {}
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    /// Run the polling loop until [`stop`](Self::stop) is called
    pub async fn start(&self) {
        let shutdown = self.begin();
        self.run_loop(shutdown).await;
    }

    /// Spawn the polling loop; returns `false` if it is already running
    pub fn start_background(&self) -> bool {
        if self.is_running() {
            warn!("Scheduler already running");
            return false;
        }

        let shutdown = self.begin();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop(shutdown).await });
        *lock(&self.inner.handle) = Some(handle);
        true
    }

    /// Signal the loop and any in-flight run to stop, then wait briefly
    pub async fn stop(&self) {
        lock(&self.inner.shutdown).cancel();
        self.inner.running.store(false, Ordering::SeqCst);

        let handle = lock(&self.inner.handle).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Scheduler loop did not stop within {}s", STOP_GRACE.as_secs());
            }
        }
    }
}
