//! HTTP session
//!
//! Executes tasks whose payload describes one HTTP request against the
//! target service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Method, StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Session, SessionFactory};
use crate::executor::ExecError;
use crate::models::Task;

/// Request description carried in `Task::payload`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Exact status required for success; any 2xx otherwise
    #[serde(default)]
    pub expect_status: Option<u16>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            expect_status: None,
        }
    }

    pub fn from_task(task: &Task) -> Result<Self, ExecError> {
        serde_json::from_value(task.payload.clone())
            .map_err(|e| ExecError::fatal(format!("Invalid HTTP payload for {}: {e}", task.id)))
    }
}

/// Builds one `reqwest` client per session
#[derive(Clone, Debug)]
pub struct HttpSessionFactory {
    timeout_secs: u64,
    base_url: Option<String>,
    default_headers: HashMap<String, String>,
}

impl HttpSessionFactory {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            base_url: None,
            default_headers: HashMap::new(),
        }
    }

    /// Prefix for relative task URLs
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn default_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    async fn create(&self) -> Result<HttpSession> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.default_headers {
            let name = HeaderName::from_bytes(key.as_bytes()).context("Invalid header name")?;
            let value = HeaderValue::from_str(value).context("Invalid header value")?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(HttpSession {
            client,
            base_url: self.base_url.clone(),
            timeout_secs: self.timeout_secs,
            healthy: true,
        })
    }
}

/// One HTTP client, used by a single worker at a time
pub struct HttpSession {
    client: Client,
    base_url: Option<String>,
    timeout_secs: u64,
    healthy: bool,
}

impl HttpSession {
    fn build_url(&self, path: &str) -> String {
        match &self.base_url {
            Some(base) if !path.starts_with("http://") && !path.starts_with("https://") => {
                format!("{}{}", base.trim_end_matches('/'), path)
            }
            _ => path.to_string(),
        }
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn execute(&mut self, task: &Task) -> Result<serde_json::Value, ExecError> {
        let spec = HttpRequestSpec::from_task(task)?;
        let url = self.build_url(&spec.url);
        let method = Method::from_bytes(spec.method.to_uppercase().as_bytes())
            .map_err(|_| ExecError::fatal(format!("Invalid HTTP method: {}", spec.method)))?;

        debug!("Sending {} request to {}", method, url);

        let mut req = self.client.request(method, &url);
        for (key, value) in &spec.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            req = req.body(body.clone());
        }

        let start = Instant::now();
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecError::transient(format!("Timeout after {} seconds", self.timeout_secs))
            } else if e.is_connect() {
                ExecError::transient(format!("Connection refused to {url}"))
            } else if e.is_builder() {
                ExecError::fatal(format!("Invalid request: {e}"))
            } else {
                ExecError::transient(format!("Request failed: {e}"))
            }
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let status = response.status();

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.healthy = false;
                return Err(ExecError::corrupted(format!("Failed to read response body: {e}")));
            }
        };

        debug!(
            "Response: {} {} in {}ms",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            duration_ms
        );

        classify_status(status, spec.expect_status, &body)?;

        let body = serde_json::from_str::<serde_json::Value>(&body)
            .unwrap_or(serde_json::Value::String(body));

        Ok(json!({
            "status": status.as_u16(),
            "duration_ms": duration_ms,
            "body": body,
        }))
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Map a response status onto the retry taxonomy
fn classify_status(status: StatusCode, expected: Option<u16>, body: &str) -> Result<(), ExecError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(ExecError::transient(format!("Upstream returned {status}")));
    }

    let ok = match expected {
        Some(code) => status.as_u16() == code,
        None => status.is_success(),
    };
    if ok {
        return Ok(());
    }

    let snippet: String = body.chars().take(200).collect();
    Err(ExecError::fatal(match expected {
        Some(code) => format!("Expected status {code}, got {status}: {snippet}"),
        None => format!("Upstream rejected request with {status}: {snippet}"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_task() {
        let task = Task::new("t1", json!({"url": "/health", "expect_status": 204}));
        let spec = HttpRequestSpec::from_task(&task).unwrap();
        assert_eq!(spec.method, "GET");
        assert_eq!(spec.url, "/health");
        assert_eq!(spec.expect_status, Some(204));
    }

    #[test]
    fn test_invalid_payload_is_fatal() {
        let task = Task::new("t1", json!({"method": "GET"}));
        let err = HttpRequestSpec::from_task(&task).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK, None, "").is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT, Some(204), "").is_ok());
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            Err(ExecError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            Err(ExecError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, "missing"),
            Err(ExecError::Fatal(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::OK, Some(201), ""),
            Err(ExecError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_build_url() {
        let session = HttpSessionFactory::new(5)
            .base_url("http://127.0.0.1:8080/")
            .create()
            .await
            .unwrap();
        assert_eq!(session.build_url("/api"), "http://127.0.0.1:8080/api");
        assert_eq!(session.build_url("https://other/x"), "https://other/x");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let mut session = HttpSessionFactory::new(2).create().await.unwrap();
        // Port 9 (discard) is closed on test hosts
        let task = Task::new("t1", json!({"url": "http://127.0.0.1:9/"}));
        let err = session.execute(&task).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(session.is_healthy());
    }
}
