//! The gated producer: retry-with-feedback around a value producer.
//!
//! Repeatedly invokes a producer closure, extracts a value from its raw
//! output, and runs gates over it. A failing attempt composes a feedback
//! string naming the failing gates, handed to the next attempt so the
//! producer (typically a model call) can correct itself.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::{run_gates, Gate, GateData, GateResult};

/// Retry policy for [`gated`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (not retries); at least 1.
    pub max: u32,
    /// Whether to compose failure feedback for the next attempt.
    pub feedback: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: 1,
            feedback: false,
        }
    }
}

/// How to turn the producer's raw output into gate data.
#[derive(Clone, Default)]
pub enum Extract {
    /// JSON when the output parses, raw text otherwise.
    #[default]
    Auto,
    Text,
    Json,
    Custom(Arc<dyn Fn(&str) -> anyhow::Result<GateData> + Send + Sync>),
}

impl std::fmt::Debug for Extract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auto => "Auto",
            Self::Text => "Text",
            Self::Json => "Json",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Configuration for one [`gated`] run.
#[derive(Clone, Default)]
pub struct GatedConfig {
    pub extract: Extract,
    pub gates: Vec<Gate>,
    pub retry: RetryConfig,
    /// Per-attempt budget for the producer call.
    pub timeout: Option<Duration>,
    /// Observer invoked after every attempt.
    pub on_attempt: Option<Arc<dyn Fn(&AttemptRecord) + Send + Sync>>,
}

/// What the producer sees on each invocation.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Feedback composed from the previous attempt's failures.
    pub feedback: Option<String>,
}

/// Record of one attempt, kept in the history.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Raw producer output; `None` when the producer itself failed.
    pub raw: Option<String>,
    pub results: Vec<GateResult>,
    pub passed: bool,
}

/// A successful [`gated`] run.
#[derive(Debug)]
pub struct GatedOutcome {
    pub attempts: u32,
    pub raw: String,
    pub data: GateData,
    pub history: Vec<AttemptRecord>,
}

/// All attempts exhausted without passing the gates.
#[derive(Debug, Error)]
#[error("gates exhausted after {attempts} attempts")]
pub struct GateExhaustion {
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
    pub last_failures: Vec<GateResult>,
}

fn compose_feedback(results: &[GateResult]) -> String {
    let lines: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| {
            format!(
                "Gate {} failed: {}",
                r.gate,
                r.reason.as_deref().unwrap_or("no reason given")
            )
        })
        .collect();
    lines.join("\n")
}

fn extract(extract: &Extract, raw: &str) -> Result<GateData, String> {
    match extract {
        Extract::Auto => Ok(GateData::auto(raw)),
        Extract::Text => Ok(GateData::Text(raw.to_owned())),
        Extract::Json => serde_json::from_str(raw)
            .map(GateData::Json)
            .map_err(|e| format!("output is not valid JSON: {e}")),
        Extract::Custom(f) => f(raw).map_err(|e| e.to_string()),
    }
}

/// Drive `producer` through up to `retry.max` gated attempts.
pub async fn gated<F, Fut>(
    producer: F,
    config: GatedConfig,
) -> Result<GatedOutcome, GateExhaustion>
where
    F: Fn(AttemptContext) -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    let max_attempts = config.retry.max.max(1);
    let mut history: Vec<AttemptRecord> = Vec::new();
    let mut feedback: Option<String> = None;

    for attempt in 1..=max_attempts {
        let ctx = AttemptContext {
            attempt,
            feedback: feedback.take(),
        };

        let produced = match config.timeout {
            Some(budget) => match tokio::time::timeout(budget, producer(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "producer timed out after {}ms",
                    budget.as_millis()
                )),
            },
            None => producer(ctx).await,
        };

        let record = match produced {
            Err(e) => {
                let started = Instant::now();
                AttemptRecord {
                    attempt,
                    raw: None,
                    results: vec![GateResult {
                        gate: "producer".to_owned(),
                        passed: false,
                        reason: Some(e.to_string()),
                        duration_ms: started.elapsed().as_millis() as u64,
                        details: None,
                    }],
                    passed: false,
                }
            }
            Ok(raw) => match extract(&config.extract, &raw) {
                Err(reason) => AttemptRecord {
                    attempt,
                    raw: Some(raw),
                    results: vec![GateResult {
                        gate: "extract".to_owned(),
                        passed: false,
                        reason: Some(reason),
                        duration_ms: 0,
                        details: None,
                    }],
                    passed: false,
                },
                Ok(data) => {
                    let (results, passed) = run_gates(&config.gates, &data).await;
                    let record = AttemptRecord {
                        attempt,
                        raw: Some(raw.clone()),
                        results,
                        passed,
                    };
                    if passed {
                        if let Some(ref hook) = config.on_attempt {
                            hook(&record);
                        }
                        history.push(record);
                        return Ok(GatedOutcome {
                            attempts: attempt,
                            raw,
                            data,
                            history,
                        });
                    }
                    record
                }
            },
        };

        if let Some(ref hook) = config.on_attempt {
            hook(&record);
        }
        if config.retry.feedback {
            feedback = Some(compose_feedback(&record.results));
        }
        history.push(record);
    }

    let last_failures = history
        .last()
        .map(|r| r.results.iter().filter(|g| !g.passed).cloned().collect())
        .unwrap_or_default();

    Err(GateExhaustion {
        attempts: max_attempts,
        history,
        last_failures,
    })
}
