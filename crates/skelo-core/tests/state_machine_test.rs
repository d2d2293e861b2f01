//! Integration tests for the task state machine: guarded transitions,
//! lease coupling, attempt/bounce budgets, and the claim lock.

use chrono::{Duration, Utc};

use skelo_core::error::SkeloError;
use skelo_core::state::{TaskStateMachine, TransitionContext};
use skelo_core::store::{self, CreateTaskInput};
use skelo_db::models::{Feedback, Task, TaskStatus};
use skelo_db::queries::audit as audit_db;
use skelo_test_utils::create_test_db;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn input(summary: &str) -> CreateTaskInput {
    CreateTaskInput {
        task_type: "code".to_owned(),
        summary: summary.to_owned(),
        prompt: "do it".to_owned(),
        backend: "claude".to_owned(),
        ..Default::default()
    }
}

fn claim_ctx(owner: &str) -> TransitionContext {
    TransitionContext {
        lease_owner: Some(owner.to_owned()),
        lease_expires_at: Some(Utc::now() + Duration::minutes(10)),
        ..Default::default()
    }
}

fn feedback() -> Feedback {
    Feedback {
        what: "missing error handling".to_owned(),
        r#where: "src/parser.rs".to_owned(),
        fix: "return a Result instead of panicking".to_owned(),
    }
}

async fn claim(pool: &sqlx::SqlitePool, id: &str) -> Task {
    TaskStateMachine::transition(pool, id, TaskStatus::InProgress, &claim_ctx("worker"))
        .await
        .expect("claim should succeed")
}

async fn to_review(pool: &sqlx::SqlitePool, id: &str) -> Task {
    TaskStateMachine::transition(
        pool,
        id,
        TaskStatus::Review,
        &TransitionContext {
            result: Some("output".to_owned()),
            ..Default::default()
        },
    )
    .await
    .expect("review transition should succeed")
}

// ---------------------------------------------------------------------------
// Claims & leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_sets_lease_and_increments_attempt() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("claim")).await.unwrap();

    let claimed = claim(&db.pool, &task.id).await;
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.lease_owner.as_deref(), Some("worker"));
    assert!(claimed.lease_expires_at.is_some());
    assert_eq!(claimed.attempt_count, 1);
}

#[tokio::test]
async fn claim_without_lease_fields_is_rejected() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("no-lease")).await.unwrap();

    let err = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::InProgress,
        &TransitionContext::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SkeloError::Transition { .. }), "{err:?}");

    let unchanged = store::get(&db.pool, &task.id).await.unwrap();
    assert_eq!(unchanged.status, TaskStatus::Pending);
    assert_eq!(unchanged.attempt_count, 0);
}

#[tokio::test]
async fn second_claim_fails_with_transition_error() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("contested")).await.unwrap();

    claim(&db.pool, &task.id).await;
    let err = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::InProgress,
        &claim_ctx("rival"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SkeloError::Transition { .. }), "{err:?}");

    let current = store::get(&db.pool, &task.id).await.unwrap();
    assert_eq!(current.lease_owner.as_deref(), Some("worker"));
    assert_eq!(current.attempt_count, 1, "failed claim must not count");
}

#[tokio::test]
async fn review_requires_result_and_clears_lease() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("review")).await.unwrap();
    claim(&db.pool, &task.id).await;

    let err = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Review,
        &TransitionContext::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SkeloError::Transition { .. }));

    let reviewed = to_review(&db.pool, &task.id).await;
    assert_eq!(reviewed.status, TaskStatus::Review);
    assert_eq!(reviewed.result.as_deref(), Some("output"));
    assert!(reviewed.lease_owner.is_none());
    assert!(reviewed.lease_expires_at.is_none());
}

#[tokio::test]
async fn release_clears_lease_without_second_increment() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("release")).await.unwrap();
    claim(&db.pool, &task.id).await;

    let released = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Pending,
        &TransitionContext {
            last_error: Some("adapter crashed".to_owned()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(released.status, TaskStatus::Pending);
    assert!(released.lease_owner.is_none());
    assert_eq!(released.attempt_count, 1, "release must not increment");
    assert_eq!(released.last_error.as_deref(), Some("adapter crashed"));

    // Reclaim consumes the next attempt.
    let reclaimed = claim(&db.pool, &task.id).await;
    assert_eq!(reclaimed.attempt_count, 2);
}

#[tokio::test]
async fn status_lease_coupling_holds_through_lifecycle() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("coupling")).await.unwrap();

    let check = |t: &Task| {
        assert_eq!(
            t.status == TaskStatus::InProgress,
            t.lease_owner.is_some(),
            "status {} with lease_owner {:?}",
            t.status,
            t.lease_owner
        );
    };

    check(&task);
    let t = claim(&db.pool, &task.id).await;
    check(&t);
    let t = to_review(&db.pool, &t.id).await;
    check(&t);
    let t = TaskStateMachine::transition(&db.pool, &t.id, TaskStatus::Done, &Default::default())
        .await
        .unwrap();
    check(&t);
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bounce_appends_feedback_and_increments() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("bounce")).await.unwrap();
    claim(&db.pool, &task.id).await;
    to_review(&db.pool, &task.id).await;

    let bounced = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Pending,
        &TransitionContext {
            feedback: Some(feedback()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(bounced.status, TaskStatus::Pending);
    assert_eq!(bounced.bounce_count, 1);
    assert_eq!(bounced.feedback_history.0.len(), 1);
    assert_eq!(bounced.feedback_history.0[0].r#where, "src/parser.rs");
}

#[tokio::test]
async fn bounce_without_feedback_is_rejected() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("no-feedback")).await.unwrap();
    claim(&db.pool, &task.id).await;
    to_review(&db.pool, &task.id).await;

    let err = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Pending,
        &TransitionContext::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SkeloError::Transition { .. }));
}

#[tokio::test]
async fn bounce_budget_exhaustion_forces_blocked() {
    let db = create_test_db().await;
    let mut create = input("bounce-budget");
    create.max_bounces = Some(1);
    let task = store::create(&db.pool, &create).await.unwrap();

    // First bounce: within budget.
    claim(&db.pool, &task.id).await;
    to_review(&db.pool, &task.id).await;
    let first = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Pending,
        &TransitionContext {
            feedback: Some(feedback()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(first.status, TaskStatus::Pending);
    assert_eq!(first.bounce_count, 1);
    assert_eq!(first.feedback_history.0.len(), 1);

    // Second bounce: budget spent, forced BLOCKED instead.
    claim(&db.pool, &task.id).await;
    to_review(&db.pool, &task.id).await;
    let second = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Pending,
        &TransitionContext {
            feedback: Some(feedback()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(second.status, TaskStatus::Blocked);
    assert_eq!(second.bounce_count, 1, "forced block is not a bounce");
}

#[tokio::test]
async fn attempt_budget_exhaustion_forces_blocked_on_claim() {
    let db = create_test_db().await;
    let mut create = input("attempt-budget");
    create.max_attempts = Some(2);
    let task = store::create(&db.pool, &create).await.unwrap();

    for expected_attempt in 1..=2 {
        let claimed = claim(&db.pool, &task.id).await;
        assert_eq!(claimed.attempt_count, expected_attempt);
        TaskStateMachine::transition(
            &db.pool,
            &task.id,
            TaskStatus::Pending,
            &TransitionContext {
                last_error: Some("failed".to_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    // Third claim would exceed max_attempts; forced BLOCKED.
    let blocked = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::InProgress,
        &claim_ctx("worker"),
    )
    .await
    .unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert_eq!(blocked.attempt_count, 2);
    assert!(blocked.last_error.unwrap().contains("attempt budget"));
}

#[tokio::test]
async fn blocked_requeues_manually() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("requeue")).await.unwrap();

    TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Blocked,
        &TransitionContext {
            reason: Some("operator hold".to_owned()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let requeued = TaskStateMachine::transition(
        &db.pool,
        &task.id,
        TaskStatus::Pending,
        &TransitionContext::default(),
    )
    .await
    .unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
}

// ---------------------------------------------------------------------------
// Audit coupling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_transition_writes_an_audit_entry() {
    let db = create_test_db().await;
    let task = store::create(&db.pool, &input("audited")).await.unwrap();

    claim(&db.pool, &task.id).await;
    to_review(&db.pool, &task.id).await;
    TaskStateMachine::transition(&db.pool, &task.id, TaskStatus::Done, &Default::default())
        .await
        .unwrap();

    let history = audit_db::task_history(&db.pool, &task.id).await.unwrap();
    let transitions: Vec<(&str, &str)> = history
        .iter()
        .filter(|e| e.action == "transition" || e.action == "release")
        .map(|e| {
            (
                e.before_state.as_deref().unwrap_or(""),
                e.after_state.as_deref().unwrap_or(""),
            )
        })
        .collect();

    assert_eq!(
        transitions,
        vec![
            ("PENDING", "IN_PROGRESS"),
            ("IN_PROGRESS", "REVIEW"),
            ("REVIEW", "DONE"),
        ]
    );
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let db = create_test_db().await;
    let err = TaskStateMachine::transition(
        &db.pool,
        "01ARZ3NDEKTSV4RRFFQ69G5FAV",
        TaskStatus::Blocked,
        &TransitionContext::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SkeloError::NotFound(_)), "{err:?}");
}
