//! Gate engine: deterministic validators run over a task's output.
//!
//! The persisted kinds ([`GateSpec`]) evaluate synchronously and are pure
//! for a given `(spec, data)` pair. The `custom` kind wraps a caller
//! supplied async predicate and is available only programmatically, via
//! [`Gate::Custom`] and the [`gated`] producer loop.

pub mod expr;
pub mod gated;

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use skelo_db::models::GateSpec;

pub use gated::{gated, GateExhaustion, GatedConfig, GatedOutcome, RetryConfig};

// ---------------------------------------------------------------------------
// Data & results
// ---------------------------------------------------------------------------

/// The value a gate evaluates: raw text or parsed JSON.
#[derive(Debug, Clone)]
pub enum GateData {
    Text(String),
    Json(Value),
}

impl GateData {
    /// `auto` extraction: JSON when the raw text parses, text otherwise.
    pub fn auto(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(v) => Self::Json(v),
            Err(_) => Self::Text(raw.to_owned()),
        }
    }

    /// The value as text, for the regex and word-count gates.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(Value::String(s)) => s.clone(),
            Self::Json(v) => v.to_string(),
        }
    }

    /// The value as JSON, for the schema and expression gates.
    pub fn as_value(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
        }
    }
}

/// The outcome of a single gate evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    /// Gate label (`regex`, `word_count`, ... or a custom name).
    pub gate: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl GateResult {
    fn pass(gate: impl Into<String>, started: Instant) -> Self {
        Self {
            gate: gate.into(),
            passed: true,
            reason: None,
            duration_ms: started.elapsed().as_millis() as u64,
            details: None,
        }
    }

    fn fail(gate: impl Into<String>, reason: impl Into<String>, started: Instant) -> Self {
        Self {
            gate: gate.into(),
            passed: false,
            reason: Some(reason.into()),
            duration_ms: started.elapsed().as_millis() as u64,
            details: None,
        }
    }
}

/// An async user-supplied predicate for the `custom` gate kind.
pub type CustomCheck =
    Arc<dyn Fn(GateData) -> BoxFuture<'static, anyhow::Result<GateResult>> + Send + Sync>;

/// A gate the engine can run: a persisted spec or a custom predicate.
#[derive(Clone)]
pub enum Gate {
    Spec(GateSpec),
    Custom {
        name: Option<String>,
        check: CustomCheck,
    },
}

impl From<GateSpec> for Gate {
    fn from(spec: GateSpec) -> Self {
        Self::Spec(spec)
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spec(spec) => f.debug_tuple("Spec").field(spec).finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a persisted gate spec. Pure and synchronous.
pub fn evaluate_spec(spec: &GateSpec, data: &GateData) -> GateResult {
    let started = Instant::now();
    match spec {
        GateSpec::Regex {
            pattern,
            flags,
            invert,
        } => {
            let mut builder = regex::RegexBuilder::new(pattern);
            if let Some(flags) = flags {
                for flag in flags.chars() {
                    match flag {
                        'i' => {
                            builder.case_insensitive(true);
                        }
                        'm' => {
                            builder.multi_line(true);
                        }
                        's' => {
                            builder.dot_matches_new_line(true);
                        }
                        _ => {}
                    }
                }
            }
            let re = match builder.build() {
                Ok(re) => re,
                Err(e) => {
                    return GateResult::fail("regex", format!("Invalid regex: {e}"), started);
                }
            };
            let matched = re.is_match(&data.as_text());
            if matched != *invert {
                GateResult::pass("regex", started)
            } else {
                let reason = if *invert {
                    format!("text matches forbidden pattern {pattern:?}")
                } else {
                    format!("text does not match pattern {pattern:?}")
                };
                GateResult::fail("regex", reason, started)
            }
        }

        GateSpec::WordCount { min, max } => {
            let count = data.as_text().split_whitespace().count() as u64;
            let lo = min.unwrap_or(0);
            if count < lo {
                GateResult::fail(
                    "word_count",
                    format!("{count} words, expected at least {lo}"),
                    started,
                )
            } else if let Some(hi) = max {
                if count > *hi {
                    GateResult::fail(
                        "word_count",
                        format!("{count} words, expected at most {hi}"),
                        started,
                    )
                } else {
                    GateResult::pass("word_count", started)
                }
            } else {
                GateResult::pass("word_count", started)
            }
        }

        GateSpec::JsonSchema { schema } => {
            let value = match data {
                GateData::Json(v) => v.clone(),
                GateData::Text(raw) => match serde_json::from_str(raw) {
                    Ok(v) => v,
                    Err(e) => {
                        return GateResult::fail(
                            "json_schema",
                            format!("data is not valid JSON: {e}"),
                            started,
                        );
                    }
                },
            };
            match check_schema(schema, &value, "$") {
                Ok(()) => GateResult::pass("json_schema", started),
                Err(reason) => GateResult::fail("json_schema", reason, started),
            }
        }

        GateSpec::Expression { expr } => match expr::evaluate(expr, &data.as_value()) {
            Ok(value) => {
                if expr::truthy(&value) {
                    GateResult::pass("expression", started)
                } else {
                    GateResult::fail(
                        "expression",
                        format!("expression evaluated to {value}"),
                        started,
                    )
                }
            }
            Err(e) => GateResult::fail("expression", e.to_string(), started),
        },
    }
}

/// Evaluate any gate, including custom predicates.
pub async fn evaluate(gate: &Gate, data: &GateData) -> GateResult {
    match gate {
        Gate::Spec(spec) => evaluate_spec(spec, data),
        Gate::Custom { name, check } => {
            let started = Instant::now();
            let label = name.clone().unwrap_or_else(|| "custom".to_owned());
            match check(data.clone()).await {
                Ok(mut result) => {
                    result.gate = label;
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    result
                }
                Err(e) => GateResult::fail(label, e.to_string(), started),
            }
        }
    }
}

/// Run gates in order, short-circuiting on the first failure. Returns the
/// results gathered and whether every executed gate passed.
pub async fn run_gates(gates: &[Gate], data: &GateData) -> (Vec<GateResult>, bool) {
    let mut results = Vec::with_capacity(gates.len());
    for gate in gates {
        let result = evaluate(gate, data).await;
        let passed = result.passed;
        results.push(result);
        if !passed {
            return (results, false);
        }
    }
    (results, true)
}

/// Run persisted specs only. Synchronous variant used by the dispatcher.
pub fn run_specs(specs: &[GateSpec], data: &GateData) -> (Vec<GateResult>, bool) {
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        let result = evaluate_spec(spec, data);
        let passed = result.passed;
        results.push(result);
        if !passed {
            return (results, false);
        }
    }
    (results, true)
}

// ---------------------------------------------------------------------------
// Lightweight JSON schema check
// ---------------------------------------------------------------------------

/// Supports `type`, `required`, and `properties{name: {type}}`, recursing
/// through nested property schemas.
fn check_schema(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let actual = json_type_name(value);
        let matches = match expected {
            "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
            other => actual == other,
        };
        if !matches {
            return Err(format!("{path}: expected type {expected}, got {actual}"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("{path}: expected an object with required fields"))?;
        for name in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(name) {
                return Err(format!("{path}: missing required field {name:?}"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        if let Some(obj) = value.as_object() {
            for (name, prop_schema) in props {
                if let Some(prop_value) = obj.get(name) {
                    check_schema(prop_schema, prop_value, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
