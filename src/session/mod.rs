//! Execution sessions
//!
//! A session is an exclusively owned, expensive resource able to run one
//! task at a time. The pool and distributor only see the [`Session`] and
//! [`SessionFactory`] traits; concrete media plug in behind them.

mod http;
mod pool;

pub use http::{HttpRequestSpec, HttpSession, HttpSessionFactory};
pub use pool::{PoolStats, PooledSession, SessionPool};

use async_trait::async_trait;

use crate::executor::ExecError;
use crate::models::Task;

/// Something that can execute one task at a time
#[async_trait]
pub trait Session: Send + 'static {
    async fn execute(&mut self, task: &Task) -> Result<serde_json::Value, ExecError>;

    /// Release underlying resources
    async fn close(&mut self) {}

    /// A session may flag itself unusable between calls
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Creates sessions on demand for a pool
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    async fn create(&self) -> anyhow::Result<Self::Session>;
}
