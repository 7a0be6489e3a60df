//! Task model
//!
//! A task is one immutable unit of work submitted to a run.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Immutable unit of work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within one run
    pub id: String,

    /// Grouping key (project, suite, capability)
    #[serde(default = "default_category")]
    pub category: String,

    /// Opaque payload interpreted by the session
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Whether the result may be served from cache
    #[serde(default)]
    pub cacheable: bool,
}

fn default_category() -> String {
    "default".to_string()
}

impl Task {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            category: default_category(),
            payload,
            cacheable: false,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Cache key derived from the request parameters, not the id.
    ///
    /// Two tasks asking the same thing share a key.
    pub fn cache_key(&self) -> Option<String> {
        if !self.cacheable {
            return None;
        }
        let payload = serde_json::to_string(&self.payload).unwrap_or_default();
        let digest = Sha256::digest(format!("{}\n{}", self.category, payload).as_bytes());
        Some(format!("{}:{:x}", self.category, digest))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.category)
    }
}
