//! Error taxonomy for task execution

use thiserror::Error;

/// Failure of a single execution attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Timeouts, throttling, connection resets
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Malformed task or permanent rejection
    #[error("Fatal failure: {0}")]
    Fatal(String),

    /// The execution medium must be discarded
    #[error("Session corrupted: {0}")]
    SessionCorrupted(String),
}

impl ExecError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ExecError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        ExecError::Fatal(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        ExecError::SessionCorrupted(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecError::Fatal(_))
    }
}

/// Conditions that abort a whole run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Session unavailable after {attempts} creation attempt(s): {reason}")]
    ResourceUnavailable { attempts: u32, reason: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Session pool is closed")]
    PoolClosed,

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Invalid concurrency {0}: must be at least 1")]
    InvalidConcurrency(usize),
}
