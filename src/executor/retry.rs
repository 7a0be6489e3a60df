//! Retry policy
//!
//! Closed set of backoff strategies with a per-variant delay function.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Backoff strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Retry immediately
    None,
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * 2^(attempt - 1)`
    #[default]
    Exponential,
}

impl RetryStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(RetryStrategy::None),
            "linear" => Some(RetryStrategy::Linear),
            "exponential" | "exp" => Some(RetryStrategy::Exponential),
            _ => None,
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::None => write!(f, "none"),
            RetryStrategy::Linear => write!(f, "linear"),
            RetryStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

/// Retry configuration, immutable for the duration of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self::new(RetryStrategy::None, 1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Whether another attempt may follow attempt number `attempt`.
    /// The `None` strategy never retries.
    pub fn attempts_remaining(&self, attempt: u32) -> bool {
        self.strategy != RetryStrategy::None && attempt < self.max_attempts
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(RetryStrategy::from_str("none"), Some(RetryStrategy::None));
        assert_eq!(RetryStrategy::from_str("Linear"), Some(RetryStrategy::Linear));
        assert_eq!(
            RetryStrategy::from_str("exponential"),
            Some(RetryStrategy::Exponential)
        );
        assert_eq!(RetryStrategy::from_str("fibonacci"), None);
    }

    #[test]
    fn test_none_delay() {
        let policy = RetryPolicy::new(RetryStrategy::None, 3, Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::ZERO);
        assert!(!policy.attempts_remaining(1));
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::new(RetryStrategy::Linear, 4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay_with_cap() {
        let policy = RetryPolicy::new(RetryStrategy::Exponential, 10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        let policy = RetryPolicy::new(RetryStrategy::Linear, 0, Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.attempts_remaining(1));
    }
}
