//! The adapter interface: external execution backends the dispatcher
//! routes tasks to.
//!
//! The trait is object-safe so adapters can be held as
//! `Arc<dyn Adapter>` in the dispatcher's routing table. Backend strings
//! are `adapter` or `adapter/model-override`; the override is applied to
//! the execution input only and never written back to the task row.

pub mod cli;
pub mod http;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use skelo_db::models::{BackendConfig, Task};

/// Everything an adapter needs to execute one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInput {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub summary: String,
    pub prompt: String,
    /// Resolved adapter name (model override stripped).
    pub backend: String,
    pub backend_config: BackendConfig,
    pub acceptance_criteria: Vec<String>,
    pub definition_of_done: Vec<String>,
    /// Parsed results of DONE dependencies, keyed by task id.
    pub upstream_results: HashMap<String, serde_json::Value>,
}

/// What an adapter reports back after executing a task.
#[derive(Debug, Clone)]
pub struct AdapterResult {
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub structured: Option<serde_json::Value>,
}

/// Exit code reported for a timed-out execution, mirroring `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// An execution backend.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Routing name, matched against the task's backend string.
    fn name(&self) -> &str;

    /// Task types this adapter serves, for WIP accounting.
    fn task_types(&self) -> &[String];

    /// Whether this adapter will take the task.
    fn can_handle(&self, task: &Task) -> bool {
        adapter_name(&task.backend) == self.name()
            && self.task_types().iter().any(|t| t == &task.task_type)
    }

    /// Execute the task to completion. A non-zero `exit_code` in the
    /// result is an execution failure; `Err` means the adapter itself
    /// could not run (spawn failure, network down).
    async fn execute(&self, input: &TaskInput) -> Result<AdapterResult>;

    /// Cooperatively cancel an in-flight execution.
    async fn abort(&self, task_id: &str) -> Result<()>;
}

// Compile-time assertion: Adapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Adapter) {}
};

/// The adapter name portion of a backend string (before the first `/`).
pub fn adapter_name(backend: &str) -> &str {
    backend.split('/').next().unwrap_or(backend)
}

/// The model override portion of a backend string (after the first `/`).
pub fn model_override(backend: &str) -> Option<&str> {
    backend.split_once('/').map(|(_, model)| model)
}

/// Build the execution input for a task: merge the per-task backend
/// config and apply any `adapter/model` override from the backend string.
pub fn build_task_input(
    task: &Task,
    upstream_results: HashMap<String, serde_json::Value>,
) -> TaskInput {
    let mut config = task
        .backend_config
        .as_ref()
        .map(|j| j.0.clone())
        .unwrap_or_default();
    if let Some(model) = model_override(&task.backend) {
        config.model = Some(model.to_owned());
    }

    TaskInput {
        id: task.id.clone(),
        task_type: task.task_type.clone(),
        summary: task.summary.clone(),
        prompt: task.prompt.clone(),
        backend: adapter_name(&task.backend).to_owned(),
        backend_config: config,
        acceptance_criteria: task.acceptance_criteria.0.clone(),
        definition_of_done: task.definition_of_done.0.clone(),
        upstream_results,
    }
}

/// Render the full prompt handed to a backend: summary, prompt, criteria,
/// definition of done, and upstream results.
pub fn render_prompt(input: &TaskInput) -> String {
    let mut out = format!("# Task: {}\n\n{}\n", input.summary, input.prompt);

    if !input.acceptance_criteria.is_empty() {
        out.push_str("\n## Acceptance criteria\n");
        for item in &input.acceptance_criteria {
            out.push_str(&format!("- {item}\n"));
        }
    }
    if !input.definition_of_done.is_empty() {
        out.push_str("\n## Definition of done\n");
        for item in &input.definition_of_done {
            out.push_str(&format!("- {item}\n"));
        }
    }
    if !input.upstream_results.is_empty() {
        out.push_str("\n## Upstream results\n");
        let mut keys: Vec<&String> = input.upstream_results.keys().collect();
        keys.sort();
        for key in keys {
            let value = &input.upstream_results[key];
            out.push_str(&format!("### {key}\n{value}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;
    use skelo_db::models::TaskStatus;

    fn task_with_backend(backend: &str) -> Task {
        let now = Utc::now();
        Task {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            task_type: "code".into(),
            status: TaskStatus::Pending,
            priority: 0,
            manual_rank: None,
            summary: "s".into(),
            prompt: "p".into(),
            acceptance_criteria: Json(vec![]),
            definition_of_done: Json(vec![]),
            backend: backend.into(),
            backend_config: None,
            result: None,
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            bounce_count: 0,
            max_attempts: 5,
            max_bounces: 3,
            last_error: None,
            feedback_history: Json(vec![]),
            depends_on: Json(vec![]),
            pipeline_id: None,
            pipeline_step: None,
            gates: Json(vec![]),
            metadata: Json(serde_json::json!({})),
            auto_review: None,
            parent_task_id: None,
            loop_iteration: 0,
            held_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn backend_without_slash() {
        assert_eq!(adapter_name("claude"), "claude");
        assert_eq!(model_override("claude"), None);
    }

    #[test]
    fn backend_with_model_override() {
        assert_eq!(adapter_name("claude/opus"), "claude");
        assert_eq!(model_override("claude/opus"), Some("opus"));
    }

    #[test]
    fn model_override_keeps_extra_slashes() {
        assert_eq!(model_override("api/org/model"), Some("org/model"));
    }

    #[test]
    fn build_input_applies_model_override() {
        let task = task_with_backend("claude/opus");
        let input = build_task_input(&task, HashMap::new());
        assert_eq!(input.backend, "claude");
        assert_eq!(input.backend_config.model.as_deref(), Some("opus"));
    }

    #[test]
    fn build_input_keeps_task_model_without_override() {
        let mut task = task_with_backend("claude");
        task.backend_config = Some(Json(BackendConfig {
            model: Some("haiku".into()),
            ..Default::default()
        }));
        let input = build_task_input(&task, HashMap::new());
        assert_eq!(input.backend_config.model.as_deref(), Some("haiku"));
    }

    #[test]
    fn rendered_prompt_includes_sections() {
        let mut task = task_with_backend("x");
        task.acceptance_criteria = Json(vec!["compiles".into()]);
        let mut upstream = HashMap::new();
        upstream.insert("dep1".to_owned(), serde_json::json!({"k": 1}));
        let input = build_task_input(&task, upstream);
        let prompt = render_prompt(&input);
        assert!(prompt.contains("Acceptance criteria"));
        assert!(prompt.contains("- compiles"));
        assert!(prompt.contains("Upstream results"));
        assert!(prompt.contains("dep1"));
    }
}
