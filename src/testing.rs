//! Instrumented fake sessions for tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::executor::ExecError;
use crate::models::Task;
use crate::session::{Session, SessionFactory};

pub type Behavior = Arc<dyn Fn(&Task, u32) -> Result<Value, ExecError> + Send + Sync>;

/// One `execute` call: task id, start, end
pub type Span = (String, Instant, Instant);

#[derive(Default)]
pub struct Tally {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
    created: AtomicUsize,
    create_attempts: AtomicUsize,
    closed: AtomicUsize,
    attempts: Mutex<HashMap<String, u32>>,
    spans: Mutex<Vec<Span>>,
}

impl Tally {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn spans(&self, task_id: &str) -> Vec<(Instant, Instant)> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == task_id)
            .map(|(_, start, end)| (*start, *end))
            .collect()
    }
}

struct ActiveGuard<'a>(&'a Tally);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct FakeFactory {
    tally: Arc<Tally>,
    behavior: Behavior,
    delay: Duration,
    fail_create: bool,
}

impl FakeFactory {
    pub fn new(behavior: impl Fn(&Task, u32) -> Result<Value, ExecError> + Send + Sync + 'static) -> Self {
        Self {
            tally: Arc::new(Tally::default()),
            behavior: Arc::new(behavior),
            delay: Duration::ZERO,
            fail_create: false,
        }
    }

    /// Every task succeeds with `{"task": id}`
    pub fn ok() -> Self {
        Self::new(|task, _| Ok(json!({ "task": task.id })))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn tally(&self) -> Arc<Tally> {
        self.tally.clone()
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn create(&self) -> anyhow::Result<FakeSession> {
        self.tally.create_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            anyhow::bail!("cannot provision session");
        }
        self.tally.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            tally: self.tally.clone(),
            behavior: self.behavior.clone(),
            delay: self.delay,
            healthy: true,
        })
    }
}

pub struct FakeSession {
    tally: Arc<Tally>,
    behavior: Behavior,
    delay: Duration,
    healthy: bool,
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&mut self, task: &Task) -> Result<Value, ExecError> {
        let attempt = {
            let mut attempts = self.tally.attempts.lock().unwrap();
            let n = attempts.entry(task.id.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let active = self.tally.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.tally);
        self.tally.max_active.fetch_max(active, Ordering::SeqCst);
        self.tally.calls.fetch_add(1, Ordering::SeqCst);

        let start = Instant::now();
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        let result = (self.behavior)(task, attempt);
        self.tally
            .spans
            .lock()
            .unwrap()
            .push((task.id.clone(), start, Instant::now()));

        if matches!(result, Err(ExecError::SessionCorrupted(_))) {
            self.healthy = false;
        }
        result
    }

    async fn close(&mut self) {
        self.tally.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}
