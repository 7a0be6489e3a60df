//! Task execution engine
//!
//! Retry policy, rate limiting, circuit breaking and the distributor that
//! drives a batch of tasks through the session pool.

mod circuit;
mod distributor;
mod error;
mod rate_limit;
mod retry;

pub use circuit::{CircuitBreaker, CircuitState};
pub use distributor::TaskDistributor;
pub use error::{ExecError, RunError};
pub use rate_limit::RateLimiter;
pub use retry::{RetryPolicy, RetryStrategy};
