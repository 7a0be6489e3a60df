//! Sliding-window rate limiter
//!
//! Bounds outbound calls to N per rolling window. The window lives behind a
//! single FIFO-fair async mutex that is held while a caller sleeps for quota,
//! so waiters are admitted in arrival order.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RunError;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Shared limiter used by every worker of a run
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `max_calls` per rolling window; 0 disables limiting
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            stamps: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, DEFAULT_WINDOW)
    }

    pub fn unlimited() -> Self {
        Self::new(0, DEFAULT_WINDOW)
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_calls == 0
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Block until a call may start, then record it
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), RunError> {
        if self.is_unlimited() {
            return Ok(());
        }

        let mut stamps = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            guard = self.stamps.lock() => guard,
        };

        loop {
            let now = Instant::now();
            prune(&mut stamps, now, self.window);

            if stamps.len() < self.max_calls {
                stamps.push_back(now);
                return Ok(());
            }

            let oldest = match stamps.front() {
                Some(oldest) => *oldest,
                None => now,
            };
            let delay = (oldest + self.window).saturating_duration_since(now);
            debug!(
                "Rate limit reached ({}/{}), waiting {}ms",
                stamps.len(),
                self.max_calls,
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RunError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    /// Record a call only if quota is free right now
    pub fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }

        let Ok(mut stamps) = self.stamps.try_lock() else {
            return false;
        };

        let now = Instant::now();
        prune(&mut stamps, now, self.window);
        if stamps.len() < self.max_calls {
            stamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Calls recorded in the current window
    pub async fn in_window(&self) -> usize {
        let mut stamps = self.stamps.lock().await;
        prune(&mut stamps, Instant::now(), self.window);
        stamps.len()
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = stamps.front() {
        if *front + window <= now {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit_in_window() {
        let limit = 5;
        let limiter = Arc::new(RateLimiter::per_minute(limit));
        let cancel = CancellationToken::new();
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait(&cancel).await.unwrap();
                starts.lock().unwrap().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        assert_eq!(starts.len(), 2 * limit);

        for (i, first) in starts.iter().enumerate() {
            let in_window = starts[i..]
                .iter()
                .filter(|s| **s < *first + Duration::from_secs(60))
                .count();
            assert!(in_window <= limit, "{in_window} calls inside one window");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire() {
        let limiter = RateLimiter::new(2, Duration::from_millis(200));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(201)).await;
        assert!(limiter.try_acquire());
        assert_eq!(limiter.in_window().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let limiter = Arc::new(RateLimiter::per_minute(1));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(RunError::Cancelled));
    }

    #[tokio::test]
    async fn test_unlimited() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert!(limiter.try_acquire());
    }
}
