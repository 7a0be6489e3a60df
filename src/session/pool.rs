//! Bounded session pool
//!
//! Sessions are created lazily up to a fixed capacity. A checkout slot is a
//! semaphore permit, so the number of sessions in use can never exceed the
//! capacity, even when a worker panics while holding one.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Session, SessionFactory};
use crate::executor::RunError;

const DEFAULT_CREATE_RETRIES: u32 = 3;
const DEFAULT_CREATE_BACKOFF: Duration = Duration::from_millis(500);

struct PoolInner<F: SessionFactory> {
    factory: F,
    capacity: usize,
    create_retries: AtomicU32,
    create_backoff: Mutex<Duration>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<F::Session>>,
    created: AtomicUsize,
    discarded: AtomicUsize,
    closed: AtomicBool,
}

impl<F: SessionFactory> PoolInner<F> {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<F::Session>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn backoff(&self) -> std::sync::MutexGuard<'_, Duration> {
        self.create_backoff.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time pool counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    /// Free checkout slots
    pub available: usize,
    pub checked_out: usize,
    pub idle: usize,
    pub created: usize,
    pub discarded: usize,
}

/// Pool of at most `capacity` sessions
pub struct SessionPool<F: SessionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: SessionFactory> Clone for SessionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: SessionFactory> SessionPool<F> {
    /// Capacity is clamped to at least one session
    pub fn new(factory: F, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                capacity,
                create_retries: AtomicU32::new(DEFAULT_CREATE_RETRIES),
                create_backoff: Mutex::new(DEFAULT_CREATE_BACKOFF),
                slots: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::with_capacity(capacity)),
                created: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Creation attempts before surfacing `ResourceUnavailable`.
    ///
    /// Applies to every clone of the pool, including ones already handed out.
    pub fn with_create_retries(self, retries: u32, backoff: Duration) -> Self {
        self.inner
            .create_retries
            .store(retries.max(1), Ordering::SeqCst);
        *self.inner.backoff() = backoff;
        self
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.inner.slots.available_permits();
        PoolStats {
            capacity: self.inner.capacity,
            available,
            checked_out: self.inner.capacity.saturating_sub(available),
            idle: self.inner.idle().len(),
            created: self.inner.created.load(Ordering::SeqCst),
            discarded: self.inner.discarded.load(Ordering::SeqCst),
        }
    }

    /// Wait for a free session, creating one if none is idle
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledSession<F>, RunError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            permit = self.inner.slots.clone().acquire_owned() => {
                permit.map_err(|_| RunError::PoolClosed)?
            }
        };

        loop {
            let candidate = self.inner.idle().pop();
            match candidate {
                Some(session) if session.is_healthy() => {
                    return Ok(PooledSession::new(session, permit, self.inner.clone()));
                }
                Some(mut session) => {
                    debug!("Discarding idle session that reports unhealthy");
                    session.close().await;
                    self.inner.discarded.fetch_add(1, Ordering::SeqCst);
                }
                None => break,
            }
        }

        let session = self.create_session(cancel).await?;
        Ok(PooledSession::new(session, permit, self.inner.clone()))
    }

    async fn create_session(&self, cancel: &CancellationToken) -> Result<F::Session, RunError> {
        let retries = self.inner.create_retries.load(Ordering::SeqCst);
        let backoff = *self.inner.backoff();
        let mut last_error = String::new();

        for attempt in 1..=retries {
            match self.inner.factory.create().await {
                Ok(session) => {
                    let created = self.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!("Created session #{} (capacity {})", created, self.inner.capacity);
                    return Ok(session);
                }
                Err(e) => {
                    warn!("Session creation attempt {}/{} failed: {:#}", attempt, retries, e);
                    last_error = format!("{e:#}");
                }
            }

            if attempt < retries {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RunError::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }
        }

        Err(RunError::ResourceUnavailable {
            attempts: retries,
            reason: last_error,
        })
    }

    /// Fail pending and future acquires, close idle sessions.
    ///
    /// Sessions still checked out are closed when released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.slots.close();

        let idle: Vec<F::Session> = std::mem::take(&mut *self.inner.idle());
        let count = idle.len();
        for mut session in idle {
            session.close().await;
        }
        info!("Session pool closed ({} idle session(s) shut down)", count);
    }
}

/// A session checked out of the pool.
///
/// Return it with [`PooledSession::release`]. Dropping it without a release
/// (panic, aborted task) destroys the session and frees the slot.
pub struct PooledSession<F: SessionFactory> {
    session: Option<F::Session>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<F>>,
}

impl<F: SessionFactory> PooledSession<F> {
    fn new(session: F::Session, permit: OwnedSemaphorePermit, pool: Arc<PoolInner<F>>) -> Self {
        Self {
            session: Some(session),
            permit: Some(permit),
            pool,
        }
    }

    /// Return the session; unhealthy sessions are destroyed and replaced lazily
    pub async fn release(mut self, healthy: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let keep = healthy && session.is_healthy() && !self.pool.closed.load(Ordering::SeqCst);
        if keep {
            self.pool.idle().push(session);
        } else {
            if !healthy {
                debug!("Discarding unhealthy session");
            }
            session.close().await;
            self.pool.discarded.fetch_add(1, Ordering::SeqCst);
        }

        // Slot is freed only after the session is back in the idle set
        self.permit.take();
    }
}

impl<F: SessionFactory> Deref for PooledSession<F> {
    type Target = F::Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_ref()
            .unwrap_or_else(|| unreachable!("session taken before release"))
    }
}

impl<F: SessionFactory> DerefMut for PooledSession<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_mut()
            .unwrap_or_else(|| unreachable!("session taken before release"))
    }
}

impl<F: SessionFactory> Drop for PooledSession<F> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        warn!("Session dropped without release, destroying it");
        self.pool.discarded.fetch_add(1, Ordering::SeqCst);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.close().await;
            });
        }
    }
}
