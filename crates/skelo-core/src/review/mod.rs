//! Auto-review: reviewer child tasks that vote on a parent's outcome.
//!
//! When a task carrying `auto_review.reviewers` enters REVIEW, one child
//! review task is spawned per reviewer. Review children execute through
//! the normal dispatch path; when one completes, the parent's fate is
//! computed by the configured strategy and the parent is approved to DONE
//! or bounced back to PENDING with the rejecting feedback.

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use skelo_db::models::{
    Feedback, ReviewStrategy, ReviewerSpec, Task, TaskStatus,
};
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;

use crate::error::SkeloError;
use crate::state::{TaskStateMachine, TransitionContext};
use crate::store::{self, CreateTaskInput};
use crate::webhook::{self, WebhookNotifier};

/// Task type of spawned review children.
pub const REVIEW_TASK_TYPE: &str = "review";

/// Default prompt template for reviewers that do not bring their own.
const DEFAULT_REVIEW_PROMPT: &str = "\
You are reviewing a completed task.

## Task summary
{{summary}}

## Original prompt
{{prompt}}

## Result under review
{{result}}

## Acceptance criteria
{{acceptance_criteria}}

## Definition of done
{{definition_of_done}}

Respond with a single JSON object:
{\"approved\": true|false, \"reasoning\": \"...\", \
\"feedback\": {\"what\": \"...\", \"where\": \"...\", \"fix\": \"...\"}}
";

/// A parsed reviewer verdict.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub feedback: Option<Feedback>,
}

/// Whether a task is a spawned review child.
pub fn is_review_child(task: &Task) -> bool {
    task.parent_task_id.is_some() && task.task_type == REVIEW_TASK_TYPE
}

fn is_merge_child(task: &Task) -> bool {
    task.metadata_value("is_merge")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse a reviewer's output into a decision.
///
/// Tries a fenced JSON block, then the whole output as JSON, then an
/// approval-keyword heuristic, and finally rejects.
pub fn parse_review_output(output: &str) -> ReviewDecision {
    let fenced = Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)```")
        .ok()
        .and_then(|re| re.captures(output))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_owned());

    for candidate in [fenced.as_deref(), Some(output.trim())].into_iter().flatten() {
        if let Ok(decision) = serde_json::from_str::<ReviewDecision>(candidate) {
            return decision;
        }
    }

    let lowered = output.to_lowercase();
    if ["approved", "lgtm", "looks good"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        return ReviewDecision {
            approved: true,
            reasoning: Some("approval keyword found in unstructured output".to_owned()),
            feedback: None,
        };
    }

    ReviewDecision {
        approved: false,
        reasoning: Some("could not parse review output".to_owned()),
        feedback: None,
    }
}

fn render_review_prompt(template: &str, parent: &Task) -> String {
    template
        .replace("{{summary}}", &parent.summary)
        .replace("{{prompt}}", &parent.prompt)
        .replace("{{result}}", parent.result.as_deref().unwrap_or(""))
        .replace(
            "{{acceptance_criteria}}",
            &parent.acceptance_criteria.0.join("\n- "),
        )
        .replace(
            "{{definition_of_done}}",
            &parent.definition_of_done.0.join("\n- "),
        )
}

fn reviewer_backend(reviewer: &ReviewerSpec) -> String {
    match reviewer.model {
        Some(ref model) => format!("{}/{model}", reviewer.backend),
        None => reviewer.backend.clone(),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Handle a task entering REVIEW: spawn reviewers for a parent carrying an
/// auto-review config, or process completion of a review child.
pub async fn handle_review_entry(
    pool: &SqlitePool,
    notifier: Option<&WebhookNotifier>,
    task: &Task,
) -> Result<(), SkeloError> {
    if is_review_child(task) {
        return handle_child_completed(pool, notifier, task).await;
    }

    let reviewers = task
        .auto_review
        .as_ref()
        .map(|j| j.0.reviewers.clone())
        .unwrap_or_default();
    if reviewers.is_empty() {
        return Ok(());
    }

    spawn_reviewers(pool, task, &reviewers).await
}

async fn spawn_reviewers(
    pool: &SqlitePool,
    parent: &Task,
    reviewers: &[ReviewerSpec],
) -> Result<(), SkeloError> {
    // Idempotence: children already spawned for this review round.
    let existing = db::list_children(pool, &parent.id).await?;
    if existing
        .iter()
        .any(|c| c.task_type == REVIEW_TASK_TYPE && !is_merge_child(c))
    {
        debug!(task_id = %parent.id, "review children already spawned");
        return Ok(());
    }

    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let mut child_ids = Vec::with_capacity(reviewers.len());

    for (i, reviewer) in reviewers.iter().enumerate() {
        let template = reviewer.prompt.as_deref().unwrap_or(DEFAULT_REVIEW_PROMPT);
        let input = CreateTaskInput {
            task_type: REVIEW_TASK_TYPE.to_owned(),
            summary: format!("Review: {}", parent.summary),
            prompt: render_review_prompt(template, parent),
            backend: reviewer_backend(reviewer),
            priority: parent.priority,
            parent_task_id: Some(parent.id.clone()),
            metadata: Some(serde_json::json!({ "reviewer_index": i })),
            ..Default::default()
        };
        let child = store::create_in_tx(&mut tx, &input, Some("auto_review")).await?;
        child_ids.push(child.id);
    }

    audit::append(
        &mut *tx,
        &NewAuditEntry {
            task_id: &parent.id,
            action: "auto_review_spawn",
            actor: Some("auto_review"),
            before_state: None,
            after_state: None,
            metadata: Some(serde_json::json!({ "children": child_ids })),
        },
    )
    .await?;

    tx.commit().await.context("failed to commit transaction")?;
    info!(task_id = %parent.id, reviewers = reviewers.len(), "spawned review children");
    Ok(())
}

// ---------------------------------------------------------------------------
// Child completion
// ---------------------------------------------------------------------------

async fn handle_child_completed(
    pool: &SqlitePool,
    notifier: Option<&WebhookNotifier>,
    child: &Task,
) -> Result<(), SkeloError> {
    // Review children do not get reviewed themselves; approve to DONE.
    let child = TaskStateMachine::transition(
        pool,
        &child.id,
        TaskStatus::Done,
        &TransitionContext {
            actor: Some("auto_review".to_owned()),
            ..Default::default()
        },
    )
    .await?;

    let Some(parent_id) = child.parent_task_id.clone() else {
        return Ok(());
    };
    let Some(parent) = db::get_task(pool, &parent_id).await? else {
        return Ok(());
    };
    if parent.status != TaskStatus::Review {
        debug!(task_id = %parent.id, status = %parent.status, "parent already decided");
        return Ok(());
    }

    let config = match parent.auto_review.as_ref() {
        Some(j) => j.0.clone(),
        None => return Ok(()),
    };

    if is_merge_child(&child) {
        let decision = parse_review_output(child.result.as_deref().unwrap_or(""));
        return decide(pool, notifier, &parent, &decision, "merge").await;
    }

    let children = db::list_children(pool, &parent.id).await?;
    let votes: Vec<&Task> = children
        .iter()
        .filter(|c| c.task_type == REVIEW_TASK_TYPE && !is_merge_child(c))
        .collect();
    let all_done = votes.iter().all(|c| c.status == TaskStatus::Done);
    let decisions: Vec<ReviewDecision> = votes
        .iter()
        .filter(|c| c.status == TaskStatus::Done)
        .map(|c| parse_review_output(c.result.as_deref().unwrap_or("")))
        .collect();

    match config.strategy {
        ReviewStrategy::AllMustApprove => {
            let this = parse_review_output(child.result.as_deref().unwrap_or(""));
            if !this.approved {
                return decide(pool, notifier, &parent, &this, "all_must_approve").await;
            }
            if all_done && decisions.iter().all(|d| d.approved) {
                let approved = ReviewDecision {
                    approved: true,
                    reasoning: Some("all reviewers approved".to_owned()),
                    feedback: None,
                };
                return decide(pool, notifier, &parent, &approved, "all_must_approve").await;
            }
        }
        ReviewStrategy::AnyApprove => {
            let this = parse_review_output(child.result.as_deref().unwrap_or(""));
            if this.approved {
                return decide(pool, notifier, &parent, &this, "any_approve").await;
            }
            if all_done && !decisions.iter().any(|d| d.approved) {
                // No approvals anywhere; the first child's feedback drives
                // the bounce.
                let first = decisions.first().cloned().unwrap_or(this);
                return decide(pool, notifier, &parent, &first, "any_approve").await;
            }
        }
        ReviewStrategy::MergeThenDecide => {
            if all_done {
                spawn_merge_child(pool, &parent, &config.merge_backend, &votes).await?;
            }
        }
    }

    Ok(())
}

async fn spawn_merge_child(
    pool: &SqlitePool,
    parent: &Task,
    merge_backend: &Option<String>,
    votes: &[&Task],
) -> Result<(), SkeloError> {
    let existing = db::list_children(pool, &parent.id).await?;
    if existing.iter().any(is_merge_child) {
        return Ok(());
    }

    let backend = merge_backend.clone().unwrap_or_else(|| {
        parent
            .auto_review
            .as_ref()
            .and_then(|j| j.0.reviewers.first().map(reviewer_backend))
            .unwrap_or_else(|| parent.backend.clone())
    });

    let mut reviews = String::new();
    for (i, vote) in votes.iter().enumerate() {
        reviews.push_str(&format!(
            "## Review {i}\n{}\n\n",
            vote.result.as_deref().unwrap_or("")
        ));
    }

    let prompt = format!(
        "Multiple reviewers assessed the task {summary:?}. Merge their \
         reviews into one final decision.\n\n{reviews}\
         Respond with a single JSON object: \
         {{\"approved\": true|false, \"reasoning\": \"...\", \
         \"feedback\": {{\"what\": \"...\", \"where\": \"...\", \"fix\": \"...\"}}}}",
        summary = parent.summary,
    );

    let input = CreateTaskInput {
        task_type: REVIEW_TASK_TYPE.to_owned(),
        summary: format!("Merge reviews: {}", parent.summary),
        prompt,
        backend,
        priority: parent.priority,
        parent_task_id: Some(parent.id.clone()),
        metadata: Some(serde_json::json!({ "is_merge": true })),
        ..Default::default()
    };

    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let merge = store::create_in_tx(&mut tx, &input, Some("auto_review")).await?;
    audit::append(
        &mut *tx,
        &NewAuditEntry {
            task_id: &parent.id,
            action: "auto_review_merge_spawn",
            actor: Some("auto_review"),
            before_state: None,
            after_state: None,
            metadata: Some(serde_json::json!({ "merge_task": merge.id })),
        },
    )
    .await?;
    tx.commit().await.context("failed to commit transaction")?;
    Ok(())
}

/// Apply a final decision to the parent: approve to DONE or bounce back to
/// PENDING with the rejecting feedback. Concurrent decisions lose the
/// transition race and are ignored.
async fn decide(
    pool: &SqlitePool,
    notifier: Option<&WebhookNotifier>,
    parent: &Task,
    decision: &ReviewDecision,
    strategy: &str,
) -> Result<(), SkeloError> {
    let result = if decision.approved {
        TaskStateMachine::transition(
            pool,
            &parent.id,
            TaskStatus::Done,
            &TransitionContext {
                actor: Some("auto_review".to_owned()),
                reason: decision.reasoning.clone(),
                ..Default::default()
            },
        )
        .await
    } else {
        let feedback = decision.feedback.clone().unwrap_or_else(|| Feedback {
            what: decision
                .reasoning
                .clone()
                .unwrap_or_else(|| "review rejected".to_owned()),
            r#where: "result".to_owned(),
            fix: "address the reviewer feedback and resubmit".to_owned(),
        });
        TaskStateMachine::transition(
            pool,
            &parent.id,
            TaskStatus::Pending,
            &TransitionContext {
                actor: Some("auto_review".to_owned()),
                feedback: Some(feedback),
                bump_loop_iteration: true,
                ..Default::default()
            },
        )
        .await
    };

    let updated = match result {
        Ok(task) => task,
        Err(SkeloError::Transition { .. }) => {
            debug!(task_id = %parent.id, "lost decision race, parent already transitioned");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    audit::append(
        pool,
        &NewAuditEntry {
            task_id: &parent.id,
            action: "auto_review_decision",
            actor: Some("auto_review"),
            before_state: None,
            after_state: Some(&updated.status.to_string()),
            metadata: Some(serde_json::json!({
                "approved": decision.approved,
                "strategy": strategy,
            })),
        },
    )
    .await?;

    webhook::notify_status(pool, notifier, &updated).await?;
    Ok(())
}
