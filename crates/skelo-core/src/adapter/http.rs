//! HTTP adapter: executes tasks by POSTing a completion request to a
//! configured endpoint.
//!
//! Rate-limit responses (429) retry with exponential backoff, honoring a
//! `Retry-After` header when present, capped at 30 seconds and a small
//! retry limit. Abort cancels the in-flight request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{render_prompt, Adapter, AdapterResult, TaskInput};

/// Maximum 429 retries per execution.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Static configuration for an [`HttpAdapter`].
#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub name: String,
    pub task_types: Vec<String>,
    /// Completion endpoint; `backend_config.url` overrides.
    pub url: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Adapter that runs each task as an HTTP completion call.
pub struct HttpAdapter {
    config: HttpAdapterConfig,
    client: reqwest::Client,
    /// Cancellation handles for in-flight requests, keyed by task id.
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl HttpAdapter {
    pub fn new(config: HttpAdapterConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let mut request = self.client.post(url).json(body);
        if let Some(ref key) = self.config.api_key {
            request = request.header("authorization", format!("Bearer {key}"));
        }
        request.send().await.context("completion request failed")
    }

    /// POST with 429 backoff. Returns the first non-429 response.
    async fn post_with_backoff(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let mut backoff = Duration::from_secs(1);
        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self.post_once(url, body).await?;
            if response.status().as_u16() != 429 {
                return Ok(response);
            }
            if attempt == MAX_RATE_LIMIT_RETRIES {
                return Err(anyhow!("rate limited after {attempt} retries"));
            }

            let wait = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(backoff)
                .min(MAX_BACKOFF);
            warn!(url, wait_ms = wait.as_millis() as u64, "rate limited, backing off");
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        unreachable!("loop returns or errors before falling through")
    }
}

/// Pull the completion text out of a response body: `output`, then
/// `completion`, then `content`, then the raw body.
fn extract_output(body: &str) -> (String, Option<Value>) {
    match serde_json::from_str::<Value>(body) {
        Ok(parsed) => {
            let output = parsed
                .get("output")
                .or_else(|| parsed.get("completion"))
                .or_else(|| parsed.get("content"))
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| body.to_owned());
            (output, Some(parsed))
        }
        Err(_) => (body.to_owned(), None),
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn task_types(&self) -> &[String] {
        &self.config.task_types
    }

    async fn execute(&self, input: &TaskInput) -> Result<AdapterResult> {
        let start = Instant::now();

        let url = input
            .backend_config
            .url
            .clone()
            .unwrap_or_else(|| self.config.url.clone());
        let model = input
            .backend_config
            .model
            .clone()
            .or_else(|| self.config.model.clone());

        let body = serde_json::json!({
            "task_id": input.id,
            "model": model,
            "prompt": render_prompt(input),
        });

        let token = CancellationToken::new();
        self.in_flight
            .lock()
            .await
            .insert(input.id.clone(), token.clone());

        let response = tokio::select! {
            r = self.post_with_backoff(&url, &body) => r,
            _ = token.cancelled() => Err(anyhow!("execution aborted")),
        };
        self.in_flight.lock().await.remove(&input.id);
        let response = response?;

        let status = response.status();
        let text = response.text().await.context("failed to read response body")?;
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(task_id = %input.id, status = %status, duration_ms, "completion response");

        if !status.is_success() {
            return Ok(AdapterResult {
                output: format!("backend returned {status}: {text}"),
                exit_code: 1,
                duration_ms,
                structured: None,
            });
        }

        let (output, structured) = extract_output(&text);
        Ok(AdapterResult {
            output,
            exit_code: 0,
            duration_ms,
            structured,
        })
    }

    async fn abort(&self, task_id: &str) -> Result<()> {
        if let Some(token) = self.in_flight.lock().await.get(task_id) {
            debug!(task_id, "aborting completion request");
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_output_field() {
        let (output, structured) = extract_output(r#"{"output": "hello"}"#);
        assert_eq!(output, "hello");
        assert!(structured.is_some());
    }

    #[test]
    fn falls_back_through_known_fields() {
        let (output, _) = extract_output(r#"{"completion": "done"}"#);
        assert_eq!(output, "done");
        let (output, _) = extract_output(r#"{"content": "text"}"#);
        assert_eq!(output, "text");
    }

    #[test]
    fn raw_body_when_not_json() {
        let (output, structured) = extract_output("plain response");
        assert_eq!(output, "plain response");
        assert!(structured.is_none());
    }

    #[test]
    fn json_without_known_field_returns_body() {
        let (output, structured) = extract_output(r#"{"weird": 1}"#);
        assert_eq!(output, r#"{"weird": 1}"#);
        assert!(structured.is_some());
    }
}
