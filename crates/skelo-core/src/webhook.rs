//! Best-effort webhook notifications.
//!
//! Events are fired-and-forgotten on a spawned task and are never part of
//! the state transaction; a delivery failure is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use skelo_db::models::{Task, TaskStatus};
use skelo_db::queries::tasks as db;

/// Event kinds emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    Review,
    Blocked,
    Done,
    PipelineHeld,
    PipelineResumed,
    PipelineComplete,
}

/// The JSON payload POSTed to every configured URL.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub event: WebhookEventKind,
    pub task_id: String,
    pub task_summary: String,
    pub task_type: String,
    pub task_status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Cheaply cloneable notifier holding the configured URLs and one client.
#[derive(Clone)]
pub struct WebhookNotifier {
    urls: Arc<Vec<String>>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(urls: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            urls: Arc::new(urls),
            client,
        }
    }

    /// Whether any URLs are configured.
    pub fn is_active(&self) -> bool {
        !self.urls.is_empty()
    }

    /// POST the event to every configured URL on a detached task.
    pub fn emit(&self, event: WebhookEvent) {
        if self.urls.is_empty() {
            return;
        }
        let urls = Arc::clone(&self.urls);
        let client = self.client.clone();
        tokio::spawn(async move {
            for url in urls.iter() {
                match client.post(url).json(&event).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(url, event = ?event.event, "webhook delivered");
                    }
                    Ok(resp) => {
                        warn!(url, status = %resp.status(), "webhook rejected");
                    }
                    Err(e) => {
                        warn!(url, error = %e, "webhook delivery failed");
                    }
                }
            }
        });
    }

    /// Build and emit an event for a task.
    pub fn emit_task(&self, kind: WebhookEventKind, task: &Task) {
        self.emit(WebhookEvent {
            event: kind,
            task_id: task.id.clone(),
            task_summary: task.summary.clone(),
            task_type: task.task_type.clone(),
            task_status: task.status,
            pipeline_id: task.pipeline_id.clone(),
            timestamp: Utc::now(),
            metadata: None,
        });
    }
}

/// Emit the event matching a task's new status, if any, and — when a task
/// in a pipeline reaches DONE — check whether the whole pipeline is now
/// complete and emit `pipeline_complete`.
pub async fn notify_status(
    pool: &SqlitePool,
    notifier: Option<&WebhookNotifier>,
    task: &Task,
) -> anyhow::Result<()> {
    let Some(notifier) = notifier else {
        return Ok(());
    };

    match task.status {
        TaskStatus::Review => notifier.emit_task(WebhookEventKind::Review, task),
        TaskStatus::Blocked => notifier.emit_task(WebhookEventKind::Blocked, task),
        TaskStatus::Done => {
            notifier.emit_task(WebhookEventKind::Done, task);
            if let Some(ref pipeline_id) = task.pipeline_id {
                let tasks = db::list_pipeline_tasks(pool, pipeline_id).await?;
                if !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Done) {
                    notifier.emit_task(WebhookEventKind::PipelineComplete, task);
                }
            }
        }
        _ => {}
    }
    Ok(())
}
