//! Integration tests for the dispatcher: claim-and-execute happy path,
//! dependency gating, WIP limits, backend routing, release on failure,
//! gate enforcement, and the expansion and auto-review flows.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use skelo_core::adapter::{Adapter, AdapterResult, TaskInput};
use skelo_core::dispatcher::{Dispatcher, DispatcherConfig, WipLimits};
use skelo_core::pipeline::{self, CreateDagPipelineInput, DagNode};
use skelo_core::state::{TaskStateMachine, TransitionContext};
use skelo_core::store::{self, CreateTaskInput};
use skelo_db::models::{
    AutoReviewConfig, GateSpec, ReviewStrategy, ReviewerSpec, TaskStatus,
};
use skelo_db::queries::audit as audit_db;
use skelo_db::queries::tasks as task_db;
use skelo_test_utils::create_test_db;

// ---------------------------------------------------------------------------
// Mock adapter
// ---------------------------------------------------------------------------

type Responder = Box<dyn Fn(&TaskInput) -> Result<AdapterResult> + Send + Sync>;

/// Adapter double that records the inputs it executes and answers with a
/// configurable response.
struct MockAdapter {
    name: String,
    task_types: Vec<String>,
    respond: Responder,
    executed: Arc<Mutex<Vec<TaskInput>>>,
}

impl MockAdapter {
    fn new(name: &str, task_types: &[&str], respond: Responder) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            task_types: task_types.iter().map(|t| (*t).to_owned()).collect(),
            respond,
            executed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn succeeding(name: &str, task_types: &[&str], output: &str) -> Arc<Self> {
        let output = output.to_owned();
        Self::new(
            name,
            task_types,
            Box::new(move |_input| {
                Ok(AdapterResult {
                    output: output.clone(),
                    exit_code: 0,
                    duration_ms: 5,
                    structured: None,
                })
            }),
        )
    }

    fn executed_ids(&self) -> Vec<String> {
        self.executed.lock().unwrap().iter().map(|i| i.id.clone()).collect()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn task_types(&self) -> &[String] {
        &self.task_types
    }

    async fn execute(&self, input: &TaskInput) -> Result<AdapterResult> {
        self.executed.lock().unwrap().push(input.clone());
        (self.respond)(input)
    }

    async fn abort(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(10),
        lease_ttl: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(60),
        wip_limits: WipLimits::default(),
        default_gates: HashMap::new(),
    }
}

fn dispatcher(pool: sqlx::SqlitePool, adapters: Vec<Arc<dyn Adapter>>) -> Dispatcher {
    Dispatcher::new(pool, fast_config(), adapters, None, None)
}

fn task(summary: &str, backend: &str) -> CreateTaskInput {
    CreateTaskInput {
        task_type: "code".to_owned(),
        summary: summary.to_owned(),
        prompt: "p".to_owned(),
        backend: backend.to_owned(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Happy path (S1)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tick_claims_executes_and_reviews() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "ok");
    let created = store::create(&db.pool, &task("fix", "mock")).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock.clone()]);
    let claimed = d.tick_once().await.unwrap();
    assert_eq!(claimed, 1);

    let after = store::get(&db.pool, &created.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Review);
    assert_eq!(after.result.as_deref(), Some("ok"));
    assert_eq!(after.attempt_count, 1);
    assert!(after.lease_owner.is_none());

    let history = audit_db::task_history(&db.pool, &created.id).await.unwrap();
    let actions: Vec<&str> = history.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"dispatch"), "actions: {actions:?}");
    assert!(actions.contains(&"execution_complete"), "actions: {actions:?}");
}

#[tokio::test]
async fn empty_queue_claims_nothing() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "ok");
    let d = dispatcher(db.pool.clone(), vec![mock]);
    assert_eq!(d.tick_once().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Dependency gating (S10)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocked_dependency_is_never_claimed() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "ok");

    let input = CreateDagPipelineInput {
        tasks: vec![
            DagNode {
                key: "a".to_owned(),
                task_type: "code".to_owned(),
                summary: "a".to_owned(),
                prompt: "p".to_owned(),
                backend: "mock".to_owned(),
                depends_on: vec![],
                priority: Some(10),
                acceptance_criteria: vec![],
                definition_of_done: vec![],
                max_attempts: None,
                max_bounces: None,
                auto_review: None,
                expand: false,
                expand_config: None,
                gates: vec![],
                backend_config: None,
                metadata: None,
            },
            DagNode {
                key: "b".to_owned(),
                task_type: "code".to_owned(),
                summary: "b".to_owned(),
                prompt: "p".to_owned(),
                backend: "mock".to_owned(),
                depends_on: vec!["a".to_owned()],
                // Higher priority than a, but gated behind it.
                priority: Some(-10),
                acceptance_criteria: vec![],
                definition_of_done: vec![],
                max_attempts: None,
                max_bounces: None,
                auto_review: None,
                expand: false,
                expand_config: None,
                gates: vec![],
                backend_config: None,
                metadata: None,
            },
        ],
    };
    let (_, tasks) = pipeline::create_dag_pipeline(&db.pool, &input).await.unwrap();
    let a = tasks.iter().find(|t| t.summary == "a").unwrap();
    let b = tasks.iter().find(|t| t.summary == "b").unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock.clone()]);
    d.tick_once().await.unwrap();

    assert_eq!(mock.executed_ids(), vec![a.id.clone()], "only a may run");
    let b_after = store::get(&db.pool, &b.id).await.unwrap();
    assert_eq!(b_after.status, TaskStatus::Pending);
}

// ---------------------------------------------------------------------------
// WIP limits & routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn saturated_type_skips_adapter() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "ok");

    // Occupy the single default WIP slot with a foreign claim.
    let occupant = store::create(&db.pool, &task("occupant", "mock")).await.unwrap();
    TaskStateMachine::transition(
        &db.pool,
        &occupant.id,
        TaskStatus::InProgress,
        &TransitionContext {
            lease_owner: Some("other".to_owned()),
            lease_expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    store::create(&db.pool, &task("waiting", "mock")).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock.clone()]);
    assert_eq!(d.tick_once().await.unwrap(), 0);
    assert!(mock.executed_ids().is_empty());
}

#[tokio::test]
async fn raised_wip_limit_allows_claim() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "ok");

    let occupant = store::create(&db.pool, &task("occupant", "mock")).await.unwrap();
    TaskStateMachine::transition(
        &db.pool,
        &occupant.id,
        TaskStatus::InProgress,
        &TransitionContext {
            lease_owner: Some("other".to_owned()),
            lease_expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    store::create(&db.pool, &task("waiting", "mock")).await.unwrap();

    let mut config = fast_config();
    config.wip_limits.per_type.insert("code".to_owned(), 2);
    let d = Dispatcher::new(db.pool.clone(), config, vec![mock.clone()], None, None);
    assert_eq!(d.tick_once().await.unwrap(), 1);
}

#[tokio::test]
async fn backend_mismatch_is_not_claimed() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "ok");
    store::create(&db.pool, &task("foreign", "someone-else")).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock.clone()]);
    assert_eq!(d.tick_once().await.unwrap(), 0);
}

#[tokio::test]
async fn model_override_reaches_the_adapter() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "ok");
    store::create(&db.pool, &task("override", "mock/fancy-model")).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock.clone()]);
    assert_eq!(d.tick_once().await.unwrap(), 1);

    let executed = mock.executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].backend, "mock");
    assert_eq!(executed[0].backend_config.model.as_deref(), Some("fancy-model"));
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nonzero_exit_releases_with_error() {
    let db = create_test_db().await;
    let mock = MockAdapter::new(
        "mock",
        &["code"],
        Box::new(|_| {
            Ok(AdapterResult {
                output: "stack trace".to_owned(),
                exit_code: 2,
                duration_ms: 5,
                structured: None,
            })
        }),
    );
    let created = store::create(&db.pool, &task("failing", "mock")).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock]);
    d.tick_once().await.unwrap();

    let after = store::get(&db.pool, &created.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.attempt_count, 1);
    let err = after.last_error.unwrap();
    assert!(err.contains("code 2"), "{err}");
}

#[tokio::test]
async fn adapter_error_releases_with_error() {
    let db = create_test_db().await;
    let mock = MockAdapter::new(
        "mock",
        &["code"],
        Box::new(|_| Err(anyhow!("network down"))),
    );
    let created = store::create(&db.pool, &task("erroring", "mock")).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock]);
    d.tick_once().await.unwrap();

    let after = store::get(&db.pool, &created.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert!(after.last_error.unwrap().contains("network down"));
}

#[tokio::test]
async fn failing_gate_releases_instead_of_review() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "short");

    let mut input = task("gated", "mock");
    input.gates = vec![GateSpec::WordCount {
        min: Some(10),
        max: None,
    }];
    let created = store::create(&db.pool, &input).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock]);
    d.tick_once().await.unwrap();

    let after = store::get(&db.pool, &created.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert!(after.last_error.unwrap().contains("gate failed"));

    let history = audit_db::task_history(&db.pool, &created.id).await.unwrap();
    assert!(history.iter().any(|e| e.action == "gate_failed"));
}

#[tokio::test]
async fn passing_gate_proceeds_to_review() {
    let db = create_test_db().await;
    let mock = MockAdapter::succeeding("mock", &["code"], "plenty of words in this output");

    let mut input = task("gated", "mock");
    input.gates = vec![GateSpec::WordCount {
        min: Some(3),
        max: None,
    }];
    let created = store::create(&db.pool, &input).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock]);
    d.tick_once().await.unwrap();

    let after = store::get(&db.pool, &created.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Review);
}

// ---------------------------------------------------------------------------
// Expansion (S and idempotence)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expand_task_materializes_children() {
    let db = create_test_db().await;
    let expansion = r#"[
        {"summary": "part one", "prompt": "do one"},
        {"summary": "part two", "prompt": "do two"}
    ]"#;
    let mock = MockAdapter::succeeding("mock", &["code"], expansion);

    let mut input = task("planner", "mock");
    input.metadata = Some(serde_json::json!({
        "expand": true,
        "expand_config": {"mode": "sequential"},
    }));
    let parent = store::create(&db.pool, &input).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock]);
    d.tick_once().await.unwrap();

    let parent_after = store::get(&db.pool, &parent.id).await.unwrap();
    assert_eq!(parent_after.status, TaskStatus::Review);

    let children = task_db::list_children(&db.pool, &parent.id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].summary, "part one");
    assert_eq!(
        children[0].metadata_value("expanded_from").unwrap(),
        &serde_json::json!(parent.id)
    );
    // Sequential mode chains the children.
    assert!(children[0].depends_on.0.is_empty());
    assert_eq!(children[1].depends_on.0, vec![children[0].id.clone()]);

    // Running the handler again is a recorded no-op.
    let again = pipeline::expand::run_expansion(&db.pool, &parent_after).await.unwrap();
    assert!(again.is_empty());
    let children = task_db::list_children(&db.pool, &parent.id).await.unwrap();
    assert_eq!(children.len(), 2, "no duplicate children");

    let history = audit_db::task_history(&db.pool, &parent.id).await.unwrap();
    assert!(history.iter().any(|e| e.action == "expand"));
    assert!(history.iter().any(|e| e.action == "expand_already_applied"));
}

#[tokio::test]
async fn expansion_rewires_downstream_dependencies() {
    let db = create_test_db().await;
    let expansion = r#"{"tasks": [
        {"summary": "gen one", "prompt": "p"},
        {"summary": "gen two", "prompt": "p"}
    ]}"#;
    let mock = MockAdapter::succeeding("mock", &["code"], expansion);

    let input = CreateDagPipelineInput {
        tasks: vec![
            DagNode {
                key: "plan".to_owned(),
                task_type: "code".to_owned(),
                summary: "plan".to_owned(),
                prompt: "p".to_owned(),
                backend: "mock".to_owned(),
                depends_on: vec![],
                priority: None,
                acceptance_criteria: vec![],
                definition_of_done: vec![],
                max_attempts: None,
                max_bounces: None,
                auto_review: None,
                expand: true,
                expand_config: None,
                gates: vec![],
                backend_config: None,
                metadata: None,
            },
            DagNode {
                key: "summarize".to_owned(),
                task_type: "code".to_owned(),
                summary: "summarize".to_owned(),
                prompt: "p".to_owned(),
                backend: "mock".to_owned(),
                depends_on: vec!["plan".to_owned()],
                priority: None,
                acceptance_criteria: vec![],
                definition_of_done: vec![],
                max_attempts: None,
                max_bounces: None,
                auto_review: None,
                expand: false,
                expand_config: None,
                gates: vec![],
                backend_config: None,
                metadata: None,
            },
        ],
    };
    let (_, tasks) = pipeline::create_dag_pipeline(&db.pool, &input).await.unwrap();
    let plan = tasks.iter().find(|t| t.summary == "plan").unwrap();
    let summarize = tasks.iter().find(|t| t.summary == "summarize").unwrap();

    let d = dispatcher(db.pool.clone(), vec![mock]);
    d.tick_once().await.unwrap();

    let children = task_db::list_children(&db.pool, &plan.id).await.unwrap();
    assert_eq!(children.len(), 2);

    // Downstream now depends on both children, not the plan task.
    let summarize_after = store::get(&db.pool, &summarize.id).await.unwrap();
    assert!(!summarize_after.depends_on.0.contains(&plan.id));
    for child in &children {
        assert!(summarize_after.depends_on.0.contains(&child.id));
        assert_eq!(child.pipeline_step, Some(0), "parallel children are roots");
    }
    assert_eq!(summarize_after.pipeline_step, Some(1));
}

// ---------------------------------------------------------------------------
// Auto-review end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auto_review_approves_parent_through_child() {
    let db = create_test_db().await;
    let worker = MockAdapter::succeeding("mock", &["code"], "the work output");
    let reviewer = MockAdapter::succeeding(
        "mock-review",
        &["review"],
        r#"{"approved": true, "reasoning": "clean"}"#,
    );

    let mut input = task("reviewed", "mock");
    input.auto_review = Some(AutoReviewConfig {
        reviewers: vec![ReviewerSpec {
            backend: "mock-review".to_owned(),
            model: None,
            prompt: None,
        }],
        strategy: ReviewStrategy::AnyApprove,
        merge_backend: None,
    });
    let parent = store::create(&db.pool, &input).await.unwrap();

    let d = dispatcher(
        db.pool.clone(),
        vec![worker.clone(), reviewer.clone()],
    );

    // Tick 1: the worker executes the parent, which enters REVIEW and
    // spawns the review child.
    d.tick_once().await.unwrap();
    let parent_mid = store::get(&db.pool, &parent.id).await.unwrap();
    assert_eq!(parent_mid.status, TaskStatus::Review);

    let children = task_db::list_children(&db.pool, &parent.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].task_type, "review");
    assert_eq!(children[0].backend, "mock-review");
    assert!(children[0].prompt.contains("the work output"));

    // Tick 2: the reviewer executes the child; its approval promotes the
    // parent to DONE and the child itself completes.
    d.tick_once().await.unwrap();

    let parent_after = store::get(&db.pool, &parent.id).await.unwrap();
    assert_eq!(parent_after.status, TaskStatus::Done);
    let child_after = store::get(&db.pool, &children[0].id).await.unwrap();
    assert_eq!(child_after.status, TaskStatus::Done);
}

#[tokio::test]
async fn auto_review_rejection_bounces_parent_with_feedback() {
    let db = create_test_db().await;
    let worker = MockAdapter::succeeding("mock", &["code"], "the work output");
    let reviewer = MockAdapter::succeeding(
        "mock-review",
        &["review"],
        r#"{"approved": false, "feedback": {"what": "off by one", "where": "loop bound", "fix": "use inclusive range"}}"#,
    );

    let mut input = task("reviewed", "mock");
    input.auto_review = Some(AutoReviewConfig {
        reviewers: vec![ReviewerSpec {
            backend: "mock-review".to_owned(),
            model: None,
            prompt: None,
        }],
        strategy: ReviewStrategy::AllMustApprove,
        merge_backend: None,
    });
    let parent = store::create(&db.pool, &input).await.unwrap();

    let d = dispatcher(db.pool.clone(), vec![worker, reviewer]);
    d.tick_once().await.unwrap();
    d.tick_once().await.unwrap();

    let parent_after = store::get(&db.pool, &parent.id).await.unwrap();
    assert_eq!(parent_after.status, TaskStatus::Pending);
    assert_eq!(parent_after.bounce_count, 1);
    assert_eq!(parent_after.loop_iteration, 1);
    assert_eq!(parent_after.feedback_history.0.len(), 1);
    assert_eq!(parent_after.feedback_history.0[0].what, "off by one");
}
