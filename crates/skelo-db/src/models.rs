use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task. Persisted as uppercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[sqlx(rename = "PENDING")]
    Pending,
    #[sqlx(rename = "IN_PROGRESS")]
    InProgress,
    #[sqlx(rename = "REVIEW")]
    Review,
    #[sqlx(rename = "DONE")]
    Done,
    #[sqlx(rename = "BLOCKED")]
    Blocked,
}

impl TaskStatus {
    /// All statuses, in lifecycle order. Used by the health endpoint counts.
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Review,
        Self::Done,
        Self::Blocked,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Review => "REVIEW",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "REVIEW" => Ok(Self::Review),
            "DONE" => Ok(Self::Done),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of template stored in the `templates` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    #[sqlx(rename = "task")]
    Task,
    #[sqlx(rename = "pipeline")]
    Pipeline,
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Pipeline => "pipeline",
        };
        f.write_str(s)
    }
}

impl FromStr for TemplateType {
    type Err = TemplateTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(TemplateTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TemplateType`] string.
#[derive(Debug, Clone)]
pub struct TemplateTypeParseError(pub String);

impl fmt::Display for TemplateTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid template type: {:?}", self.0)
    }
}

impl std::error::Error for TemplateTypeParseError {}

// ---------------------------------------------------------------------------
// JSON column payloads
// ---------------------------------------------------------------------------

/// One reviewer rejection recorded on a bounce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// What is wrong.
    pub what: String,
    /// Where it is wrong (file, section, step).
    pub r#where: String,
    /// How to fix it.
    pub fix: String,
}

/// A persisted gate specification, run over a task's result before it
/// enters REVIEW. The `custom` gate kind is programmatic-only and therefore
/// not part of this enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateSpec {
    Regex {
        pattern: String,
        #[serde(default)]
        flags: Option<String>,
        #[serde(default)]
        invert: bool,
    },
    WordCount {
        #[serde(default)]
        min: Option<u64>,
        #[serde(default)]
        max: Option<u64>,
    },
    JsonSchema {
        schema: serde_json::Value,
    },
    Expression {
        expr: String,
    },
}

impl GateSpec {
    /// Short label used in results and feedback messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Regex { .. } => "regex",
            Self::WordCount { .. } => "word_count",
            Self::JsonSchema { .. } => "json_schema",
            Self::Expression { .. } => "expression",
        }
    }
}

/// Per-task adapter configuration, merged over the adapter's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// How the decisions of auto-review children combine into the parent's fate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStrategy {
    #[default]
    AllMustApprove,
    AnyApprove,
    MergeThenDecide,
}

/// One reviewer in an auto-review configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerSpec {
    /// Adapter name the review child is routed to.
    pub backend: String,
    /// Optional model override, appended as `backend/model`.
    #[serde(default)]
    pub model: Option<String>,
    /// Optional reviewer-specific prompt template.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Auto-review configuration carried on a task. When present and non-empty,
/// entering REVIEW spawns one child review task per reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReviewConfig {
    pub reviewers: Vec<ReviewerSpec>,
    #[serde(default)]
    pub strategy: ReviewStrategy,
    #[serde(default)]
    pub merge_backend: Option<String>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the central unit of work, executed by one adapter invocation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub manual_rank: Option<f64>,
    pub summary: String,
    pub prompt: String,
    pub acceptance_criteria: Json<Vec<String>>,
    pub definition_of_done: Json<Vec<String>>,
    pub backend: String,
    pub backend_config: Option<Json<BackendConfig>>,
    pub result: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i64,
    pub bounce_count: i64,
    pub max_attempts: i64,
    pub max_bounces: i64,
    pub last_error: Option<String>,
    pub feedback_history: Json<Vec<Feedback>>,
    pub depends_on: Json<Vec<String>>,
    pub pipeline_id: Option<String>,
    pub pipeline_step: Option<i64>,
    pub gates: Json<Vec<GateSpec>>,
    pub metadata: Json<serde_json::Value>,
    pub auto_review: Option<Json<AutoReviewConfig>>,
    pub parent_task_id: Option<String>,
    pub loop_iteration: i64,
    pub held_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Look up a metadata key, treating a non-object metadata value as empty.
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.0.as_object().and_then(|m| m.get(key))
    }

    /// Whether the dynamic expansion protocol applies to this task.
    pub fn is_expand(&self) -> bool {
        self.metadata_value("expand")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// An entry in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: String,
    pub task_id: String,
    pub action: String,
    pub actor: Option<String>,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    pub metadata: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

/// A named task or pipeline template with `{{var}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub template_type: TemplateType,
    pub definition: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        for v in &TaskStatus::ALL {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_serde_uses_wire_names() {
        let s = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(s, "\"IN_PROGRESS\"");
        let parsed: TaskStatus = serde_json::from_str("\"BLOCKED\"").unwrap();
        assert_eq!(parsed, TaskStatus::Blocked);
    }

    #[test]
    fn task_status_invalid() {
        assert!("pending".parse::<TaskStatus>().is_err());
        assert!("RUNNING".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn template_type_display_roundtrip() {
        for v in &[TemplateType::Task, TemplateType::Pipeline] {
            let s = v.to_string();
            let parsed: TemplateType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn template_type_invalid() {
        assert!("dag".parse::<TemplateType>().is_err());
    }

    #[test]
    fn gate_spec_tagged_by_type() {
        let spec: GateSpec =
            serde_json::from_str(r#"{"type": "regex", "pattern": "^ok$"}"#).unwrap();
        assert!(matches!(spec, GateSpec::Regex { ref pattern, .. } if pattern == "^ok$"));

        let spec: GateSpec =
            serde_json::from_str(r#"{"type": "word_count", "min": 2}"#).unwrap();
        assert!(matches!(
            spec,
            GateSpec::WordCount {
                min: Some(2),
                max: None
            }
        ));
    }

    #[test]
    fn review_strategy_defaults_to_all_must_approve() {
        let cfg: AutoReviewConfig = serde_json::from_str(
            r#"{"reviewers": [{"backend": "claude"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.strategy, ReviewStrategy::AllMustApprove);
        assert_eq!(cfg.reviewers.len(), 1);
        assert!(cfg.merge_backend.is_none());
    }

    #[test]
    fn feedback_serializes_where_keyword() {
        let fb = Feedback {
            what: "missing tests".into(),
            r#where: "src/lib.rs".into(),
            fix: "add a case for the empty input".into(),
        };
        let json = serde_json::to_value(&fb).unwrap();
        assert_eq!(json["where"], "src/lib.rs");
    }
}
