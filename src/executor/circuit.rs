//! Circuit breaker shared by all workers of a run
//!
//! Closed lets calls through. After `failure_threshold` consecutive transient
//! failures the breaker opens and every worker pauses until
//! `recovery_timeout` has elapsed; one probe call is then admitted
//! (half-open) and its result closes or re-opens the circuit.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::RunError;

const PROBE_POLL: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_started: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// `Ok` if a call may proceed, otherwise how long to wait before asking again
    pub fn check(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.recovery_timeout {
                    info!("Circuit '{}' half-open, admitting probe", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(now);
                    Ok(())
                } else {
                    Err(self.recovery_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => match inner.probe_started {
                // A probe that never reported back does not hold the circuit forever
                Some(started) if now.saturating_duration_since(started) < self.recovery_timeout => {
                    Err(PROBE_POLL)
                }
                _ => {
                    inner.probe_started = Some(now);
                    Ok(())
                }
            },
        }
    }

    /// Pause until the breaker admits a call
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<(), RunError> {
        loop {
            match self.check() {
                Ok(()) => return Ok(()),
                Err(delay) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RunError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit '{}' closed", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if trip {
            warn!(
                "Circuit '{}' opened after {} consecutive failure(s)",
                self.name, inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_started = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("svc", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe() {
        let breaker = CircuitBreaker::new("svc", 1, Duration::from_secs(10));
        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one probe at a time
        assert!(breaker.check().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new("svc", 1, Duration::from_secs(5));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_pauses_until_recovery() {
        let breaker = CircuitBreaker::new("svc", 1, Duration::from_secs(5));
        breaker.record_failure();

        let start = Instant::now();
        breaker.wait_ready(&CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new("svc", 2, Duration::from_secs(5));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
