//! The HTTP control plane.
//!
//! A thin axum translation layer over the core: every route maps onto a
//! store, queue, pipeline, or state-machine call, and domain errors map
//! onto status codes (400 validation, 404 not found, 409 transition, 500
//! internal). Authentication is a shared `x-api-key` header, bypassed for
//! `/health` and `/dashboard`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tracing::warn;

use skelo_core::error::SkeloError;
use skelo_core::pipeline::{self, CreateDagPipelineInput};
use skelo_core::queue::{self, NextFilter, Position};
use skelo_core::review;
use skelo_core::state::{TaskStateMachine, TransitionContext};
use skelo_core::store::{self, CreateTaskInput, TaskFilter, TaskPatch};
use skelo_core::webhook::{self, WebhookNotifier};
use skelo_db::models::{Task, TaskStatus};
use skelo_db::queries::audit as audit_db;
use skelo_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// State & error type
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub api_key: Option<String>,
    pub notifier: Option<WebhookNotifier>,
    /// Lease TTL applied by the claim-next endpoint.
    pub lease_ttl: Duration,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "invalid or missing x-api-key".to_owned(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }
}

impl From<SkeloError> for AppError {
    fn from(e: SkeloError) -> Self {
        let status = match &e {
            SkeloError::Validation(_) => StatusCode::BAD_REQUEST,
            SkeloError::NotFound(_) => StatusCode::NOT_FOUND,
            SkeloError::Transition { .. } => StatusCode::CONFLICT,
            SkeloError::Adapter(_) | SkeloError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: format!("{e:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/dashboard", get(dashboard))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/claim-next", post(claim_next))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/priority", patch(patch_priority))
        .route("/tasks/{id}/reorder", patch(patch_reorder))
        .route("/tasks/{id}/transition", post(post_transition))
        .route("/tasks/{id}/heartbeat", post(post_heartbeat))
        .route("/tasks/{id}/release", post(post_release))
        .route("/pipelines", post(create_pipeline).get(list_pipelines))
        .route("/pipelines/{id}", get(get_pipeline))
        .route("/audit", get(list_audit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("skelo serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("skelo serve shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/health" || path == "/dashboard" {
        return next.run(req).await;
    }

    if let Some(ref key) = state.api_key {
        let provided = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(key.as_str()) {
            return AppError::unauthorized().into_response();
        }
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Post-transition hooks
// ---------------------------------------------------------------------------

/// What the dispatcher does after a transition, minus gate evaluation:
/// webhooks, then the expansion and auto-review handlers for tasks that
/// entered REVIEW (or DONE, for expansion).
async fn run_post_transition(state: &AppState, task: &Task) -> Result<(), SkeloError> {
    webhook::notify_status(&state.pool, state.notifier.as_ref(), task).await?;

    if matches!(task.status, TaskStatus::Review | TaskStatus::Done) && task.is_expand() {
        if let Err(e) = pipeline::expand::run_expansion(&state.pool, task).await {
            warn!(task_id = %task.id, error = %e, "expansion failed");
        }
    }
    if task.status == TaskStatus::Review {
        review::handle_review_entry(&state.pool, state.notifier.as_ref(), task).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Result<Response, AppError> {
    let rows = task_db::status_counts(&state.pool)
        .await
        .map_err(SkeloError::from)?;
    let by_status: HashMap<String, i64> = rows.into_iter().collect();

    let mut counts = serde_json::Map::new();
    for status in TaskStatus::ALL {
        let key = status.to_string();
        let count = by_status.get(&key).copied().unwrap_or(0);
        counts.insert(key, count.into());
    }

    Ok(Json(serde_json::json!({ "status": "ok", "counts": counts })).into_response())
}

async fn dashboard(State(state): State<AppState>) -> Result<Response, AppError> {
    let rows = task_db::status_counts(&state.pool)
        .await
        .map_err(SkeloError::from)?;
    let by_status: HashMap<String, i64> = rows.into_iter().collect();

    let count_rows: String = TaskStatus::ALL
        .iter()
        .map(|s| {
            let key = s.to_string();
            let count = by_status.get(&key).copied().unwrap_or(0);
            format!("<tr><td>{key}</td><td>{count}</td></tr>")
        })
        .collect();

    let recent = store::list(&state.pool, &TaskFilter::default(), 20, 0).await?;
    let task_rows = if recent.is_empty() {
        "<tr><td colspan=\"4\">No tasks yet.</td></tr>".to_owned()
    } else {
        recent
            .iter()
            .map(|t| {
                format!(
                    "<tr><td>{id}</td><td>{summary}</td><td>{status}</td><td>{backend}</td></tr>",
                    id = t.id,
                    summary = t.summary,
                    status = t.status,
                    backend = t.backend,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>skelo</title></head><body>\
<h1>skelo</h1>\
<table><tr><th>Status</th><th>Count</th></tr>{count_rows}</table>\
<h2>Recent tasks</h2>\
<table><tr><th>ID</th><th>Summary</th><th>Status</th><th>Backend</th></tr>{task_rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn create_task(
    State(state): State<AppState>,
    Json(input): Json<CreateTaskInput>,
) -> Result<Response, AppError> {
    let task = store::create(&state.pool, &input).await?;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    task_type: Option<String>,
    pipeline_id: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Response, AppError> {
    let status = match query.status {
        Some(ref s) => Some(
            s.parse::<TaskStatus>()
                .map_err(|e| AppError::bad_request(e.to_string()))?,
        ),
        None => None,
    };
    let filter = TaskFilter {
        status,
        task_type: query.task_type,
        pipeline_id: query.pipeline_id,
    };
    let tasks = store::list(
        &state.pool,
        &filter,
        query.limit.unwrap_or(100),
        query.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(tasks).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let task = store::get(&state.pool, &id).await?;
    Ok(Json(task).into_response())
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    priority: i64,
}

async fn patch_priority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PriorityBody>,
) -> Result<Response, AppError> {
    let patch = TaskPatch {
        priority: Some(body.priority),
        ..Default::default()
    };
    let task = store::update(&state.pool, &id, &patch).await?;
    Ok(Json(task).into_response())
}

#[derive(Debug, Deserialize)]
struct ReorderBody {
    position: Position,
}

async fn patch_reorder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReorderBody>,
) -> Result<Response, AppError> {
    queue::reorder(&state.pool, &id, &body.position).await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

#[derive(Debug, Deserialize)]
struct TransitionBody {
    to: String,
    #[serde(flatten)]
    context: TransitionContext,
}

async fn post_transition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> Result<Response, AppError> {
    let to = body
        .to
        .parse::<TaskStatus>()
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let task = TaskStateMachine::transition(&state.pool, &id, to, &body.context).await?;
    run_post_transition(&state, &task).await?;
    Ok(Json(task).into_response())
}

async fn post_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let task = store::get(&state.pool, &id).await?;
    let expires =
        Utc::now() + chrono::Duration::milliseconds(state.lease_ttl.as_millis() as i64);
    let rows = task_db::update_lease_expiry(&state.pool, &task.id, expires)
        .await
        .map_err(SkeloError::from)?;
    if rows > 0 {
        audit_db::append(
            &state.pool,
            &audit_db::NewAuditEntry {
                task_id: &task.id,
                action: "heartbeat",
                actor: task.lease_owner.as_deref(),
                before_state: None,
                after_state: None,
                metadata: None,
            },
        )
        .await
        .map_err(SkeloError::from)?;
    }
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ReleaseBody {
    error: Option<String>,
}

async fn post_release(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReleaseBody>,
) -> Result<Response, AppError> {
    let task = TaskStateMachine::transition(
        &state.pool,
        &id,
        TaskStatus::Pending,
        &TransitionContext {
            last_error: body.error,
            ..Default::default()
        },
    )
    .await?;
    run_post_transition(&state, &task).await?;
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

#[derive(Debug, Deserialize)]
struct ClaimNextBody {
    #[serde(rename = "type")]
    task_type: Option<String>,
    lease_owner: Option<String>,
}

async fn claim_next(
    State(state): State<AppState>,
    Json(body): Json<ClaimNextBody>,
) -> Result<Response, AppError> {
    let Some(lease_owner) = body.lease_owner.filter(|o| !o.is_empty()) else {
        return Err(AppError::bad_request("lease_owner is required"));
    };

    let mut filter = NextFilter {
        task_type: body.task_type,
        exclude_ids: Vec::new(),
    };

    // Tasks whose claim forces BLOCKED (spent attempt budget) are skipped
    // rather than surfaced to the caller.
    loop {
        let Some(task) = queue::get_next_ready(&state.pool, &filter).await? else {
            return Err(AppError::not_found("no eligible task"));
        };

        let expires =
            Utc::now() + chrono::Duration::milliseconds(state.lease_ttl.as_millis() as i64);
        let claimed = TaskStateMachine::transition(
            &state.pool,
            &task.id,
            TaskStatus::InProgress,
            &TransitionContext {
                lease_owner: Some(lease_owner.clone()),
                lease_expires_at: Some(expires),
                ..Default::default()
            },
        )
        .await?;

        if claimed.status == TaskStatus::InProgress {
            return Ok(Json(claimed).into_response());
        }
        filter.exclude_ids.push(task.id);
    }
}

async fn create_pipeline(
    State(state): State<AppState>,
    Json(input): Json<CreateDagPipelineInput>,
) -> Result<Response, AppError> {
    let (pipeline_id, tasks) = pipeline::create_dag_pipeline(&state.pool, &input).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "pipeline_id": pipeline_id, "tasks": tasks })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ListPipelinesQuery {
    status: Option<String>,
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<Response, AppError> {
    let summaries = pipeline::list_pipelines(&state.pool, query.status.as_deref()).await?;
    Ok(Json(summaries).into_response())
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let tasks = task_db::list_pipeline_tasks(&state.pool, &id)
        .await
        .map_err(SkeloError::from)?;
    if tasks.is_empty() {
        return Err(AppError::not_found(format!("pipeline {id} not found")));
    }
    Ok(Json(tasks).into_response())
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    task_id: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Response, AppError> {
    let entries = audit_db::list(
        &state.pool,
        query.task_id.as_deref(),
        query.limit.unwrap_or(100),
        query.offset.unwrap_or(0),
    )
    .await
    .map_err(SkeloError::from)?;
    Ok(Json(entries).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use skelo_test_utils::create_test_db;

    fn test_state(pool: SqlitePool, api_key: Option<&str>) -> AppState {
        AppState {
            pool,
            api_key: api_key.map(str::to_owned),
            notifier: None,
            lease_ttl: Duration::from_secs(600),
        }
    }

    async fn send(
        state: AppState,
        method: &str,
        uri: &str,
        api_key: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response {
        let app = build_router(state);
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn task_body(summary: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "code",
            "summary": summary,
            "prompt": "do the thing",
            "backend": "claude",
        })
    }

    #[tokio::test]
    async fn health_is_open_and_counts_statuses() {
        let db = create_test_db().await;
        let resp = send(test_state(db.pool.clone(), Some("k")), "GET", "/health", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["counts"]["PENDING"], 0);
        assert_eq!(json["counts"]["IN_PROGRESS"], 0);
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected() {
        let db = create_test_db().await;
        let resp = send(test_state(db.pool.clone(), Some("secret")), "GET", "/tasks", None, None).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("x-api-key"));
    }

    #[tokio::test]
    async fn dashboard_is_open() {
        let db = create_test_db().await;
        let resp = send(test_state(db.pool.clone(), Some("k")), "GET", "/dashboard", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_fetch_task() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);

        let resp = send(state.clone(), "POST", "/tasks", None, Some(task_body("fix"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_owned();
        assert_eq!(created["status"], "PENDING");

        let resp = send(state, "GET", &format!("/tasks/{id}"), None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["summary"], "fix");
    }

    #[tokio::test]
    async fn create_task_missing_fields_is_400() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);
        let resp = send(
            state,
            "POST",
            "/tasks",
            None,
            Some(serde_json::json!({"summary": "x", "prompt": "", "backend": "b"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);
        let resp = send(state, "GET", "/tasks/01JUNKJUNKJUNKJUNKJUNKJUNK", None, None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_transition_is_409() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);

        let resp = send(state.clone(), "POST", "/tasks", None, Some(task_body("t"))).await;
        let id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        let resp = send(
            state,
            "POST",
            &format!("/tasks/{id}/transition"),
            None,
            Some(serde_json::json!({"to": "DONE"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn claim_next_requires_lease_owner() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);
        let resp = send(
            state,
            "POST",
            "/tasks/claim-next",
            None,
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn claim_next_claims_in_priority_order() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);

        let mut low = task_body("low");
        low["priority"] = serde_json::json!(5);
        let mut high = task_body("high");
        high["priority"] = serde_json::json!(-5);
        send(state.clone(), "POST", "/tasks", None, Some(low)).await;
        send(state.clone(), "POST", "/tasks", None, Some(high)).await;

        let resp = send(
            state,
            "POST",
            "/tasks/claim-next",
            None,
            Some(serde_json::json!({"lease_owner": "worker-1"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let claimed = body_json(resp).await;
        assert_eq!(claimed["summary"], "high");
        assert_eq!(claimed["status"], "IN_PROGRESS");
        assert_eq!(claimed["lease_owner"], "worker-1");
        assert_eq!(claimed["attempt_count"], 1);
    }

    #[tokio::test]
    async fn claim_next_empty_queue_is_404() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);
        let resp = send(
            state,
            "POST",
            "/tasks/claim-next",
            None,
            Some(serde_json::json!({"lease_owner": "w"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pipeline_cycle_is_400_and_nothing_persists() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);

        let body = serde_json::json!({"tasks": [
            {"key": "a", "summary": "a", "prompt": "p", "backend": "x", "depends_on": ["c"]},
            {"key": "b", "summary": "b", "prompt": "p", "backend": "x", "depends_on": ["a"]},
            {"key": "c", "summary": "c", "prompt": "p", "backend": "x", "depends_on": ["b"]},
        ]});
        let resp = send(state.clone(), "POST", "/pipelines", None, Some(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("Cycle detected"));

        let resp = send(state, "GET", "/tasks", None, None).await;
        let tasks = body_json(resp).await;
        assert_eq!(tasks.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn pipeline_create_and_fetch_sorted_by_step() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);

        let body = serde_json::json!({"tasks": [
            {"key": "c", "summary": "c", "prompt": "p", "backend": "x", "depends_on": ["a", "b"]},
            {"key": "a", "summary": "a", "prompt": "p", "backend": "x"},
            {"key": "b", "summary": "b", "prompt": "p", "backend": "x"},
        ]});
        let resp = send(state.clone(), "POST", "/pipelines", None, Some(body)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let pipeline_id = created["pipeline_id"].as_str().unwrap().to_owned();

        let resp = send(state, "GET", &format!("/pipelines/{pipeline_id}"), None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let tasks = body_json(resp).await;
        let steps: Vec<i64> = tasks
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["pipeline_step"].as_i64().unwrap())
            .collect();
        assert_eq!(steps, vec![0, 0, 1]);
    }

    #[tokio::test]
    async fn audit_lists_create_entries() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);

        let resp = send(state.clone(), "POST", "/tasks", None, Some(task_body("t"))).await;
        let id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        let resp = send(state, "GET", &format!("/audit?task_id={id}"), None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let entries = body_json(resp).await;
        let actions: Vec<&str> = entries
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["action"].as_str().unwrap())
            .collect();
        assert!(actions.contains(&"create"), "actions: {actions:?}");
    }

    #[tokio::test]
    async fn reorder_moves_task_to_top() {
        let db = create_test_db().await;
        let state = test_state(db.pool.clone(), None);

        let first =
            body_json(send(state.clone(), "POST", "/tasks", None, Some(task_body("one"))).await)
                .await;
        let second =
            body_json(send(state.clone(), "POST", "/tasks", None, Some(task_body("two"))).await)
                .await;
        let second_id = second["id"].as_str().unwrap();
        let _ = first;

        let resp = send(
            state.clone(),
            "PATCH",
            &format!("/tasks/{second_id}/reorder"),
            None,
            Some(serde_json::json!({"position": {"top": true}})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            state,
            "POST",
            "/tasks/claim-next",
            None,
            Some(serde_json::json!({"lease_owner": "w"})),
        )
        .await;
        let claimed = body_json(resp).await;
        assert_eq!(claimed["summary"], "two");
    }
}
