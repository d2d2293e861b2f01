//! Integration tests for template storage and instantiation.

use std::collections::HashMap;

use skelo_core::error::SkeloError;
use skelo_core::template::{self, InstantiationResult};
use skelo_db::models::{TaskStatus, TemplateType};
use skelo_test_utils::create_test_db;

fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[tokio::test]
async fn task_template_instantiates_with_substitution() {
    let db = create_test_db().await;

    template::create_template(
        &db.pool,
        "bugfix",
        TemplateType::Task,
        serde_json::json!({
            "type": "code",
            "summary": "fix {{component}}",
            "prompt": "please fix the {{component}} ({{severity:-minor}} severity)",
            "backend": "claude",
        }),
        Some("standard bugfix"),
    )
    .await
    .unwrap();

    let result = template::instantiate(&db.pool, "bugfix", &vars(&[("component", "lexer")]))
        .await
        .unwrap();

    let InstantiationResult::Task(task) = result else {
        panic!("expected a task instantiation");
    };
    assert_eq!(task.summary, "fix lexer");
    assert_eq!(task.prompt, "please fix the lexer (minor severity)");
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn pipeline_template_instantiates_a_dag() {
    let db = create_test_db().await;

    template::create_template(
        &db.pool,
        "research-then-write",
        TemplateType::Pipeline,
        serde_json::json!({
            "tasks": [
                {"key": "research", "summary": "research {{topic}}",
                 "prompt": "research {{topic}}", "backend": "claude"},
                {"key": "write", "summary": "write up {{topic}}",
                 "prompt": "write up {{topic}}", "backend": "claude",
                 "depends_on": ["research"]},
            ]
        }),
        None,
    )
    .await
    .unwrap();

    let result = template::instantiate(
        &db.pool,
        "research-then-write",
        &vars(&[("topic", "lease recovery")]),
    )
    .await
    .unwrap();

    let InstantiationResult::Pipeline { pipeline_id, tasks } = result else {
        panic!("expected a pipeline instantiation");
    };
    assert!(!pipeline_id.is_empty());
    assert_eq!(tasks.len(), 2);
    let research = tasks.iter().find(|t| t.pipeline_step == Some(0)).unwrap();
    let write = tasks.iter().find(|t| t.pipeline_step == Some(1)).unwrap();
    assert_eq!(research.summary, "research lease recovery");
    assert_eq!(write.depends_on.0, vec![research.id.clone()]);
}

#[tokio::test]
async fn missing_variable_fails_instantiation() {
    let db = create_test_db().await;

    template::create_template(
        &db.pool,
        "strict",
        TemplateType::Task,
        serde_json::json!({
            "summary": "{{required_thing}}",
            "prompt": "p",
            "backend": "x",
        }),
        None,
    )
    .await
    .unwrap();

    let err = template::instantiate(&db.pool, "strict", &vars(&[])).await.unwrap_err();
    assert!(matches!(err, SkeloError::Validation(_)), "{err:?}");
    assert!(err.to_string().contains("required_thing"), "{err}");
}

#[tokio::test]
async fn unknown_template_is_not_found() {
    let db = create_test_db().await;
    let err = template::instantiate(&db.pool, "ghost", &vars(&[])).await.unwrap_err();
    assert!(matches!(err, SkeloError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn duplicate_template_name_rejected() {
    let db = create_test_db().await;
    template::create_template(&db.pool, "dup", TemplateType::Task, serde_json::json!({}), None)
        .await
        .unwrap();
    let err = template::create_template(
        &db.pool,
        "dup",
        TemplateType::Task,
        serde_json::json!({}),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SkeloError::Validation(_)), "{err:?}");
}
