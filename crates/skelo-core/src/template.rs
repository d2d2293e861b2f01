//! Named task and pipeline templates with `{{var}}` substitution.
//!
//! A template's definition is a JSON object shaped like a
//! [`CreateTaskInput`] (`template_type = task`) or a
//! [`CreateDagPipelineInput`] (`template_type = pipeline`). Instantiation
//! deep-copies the definition, substitutes `{{var}}` and
//! `{{var:-default}}` placeholders in every string, and creates the
//! task(s) through the normal store and pipeline paths.

use std::collections::HashMap;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;

use skelo_db::ids;
use skelo_db::models::{Task, Template, TemplateType};
use skelo_db::queries::templates as db;

use crate::error::SkeloError;
use crate::pipeline::{self, CreateDagPipelineInput};
use crate::store::{self, CreateTaskInput};

/// What a template instantiation produced.
#[derive(Debug)]
pub enum InstantiationResult {
    Task(Task),
    Pipeline {
        pipeline_id: String,
        tasks: Vec<Task>,
    },
}

fn placeholder_regex() -> Regex {
    // {{var}} or {{var:-default}}; the default may be empty.
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)(?::-([^}]*))?\s*\}\}").expect("static regex")
}

/// Substitute placeholders in a string. A placeholder without a binding
/// and without a default is a validation error.
pub fn substitute(text: &str, vars: &HashMap<String, String>) -> Result<String, SkeloError> {
    let re = placeholder_regex();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        out.push_str(&text[last..whole.start()]);

        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => match caps.get(2) {
                Some(default) => out.push_str(default.as_str()),
                None => {
                    return Err(SkeloError::validation(format!(
                        "missing template variable {name:?}"
                    )));
                }
            },
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Recursively substitute placeholders through a JSON value.
pub fn substitute_value(
    value: &Value,
    vars: &HashMap<String, String>,
) -> Result<Value, SkeloError> {
    Ok(match value {
        Value::String(s) => Value::String(substitute(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(key.clone(), substitute_value(v, vars)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Create a named template. Names are unique.
pub async fn create_template(
    pool: &SqlitePool,
    name: &str,
    template_type: TemplateType,
    definition: Value,
    description: Option<&str>,
) -> Result<Template, SkeloError> {
    if name.trim().is_empty() {
        return Err(SkeloError::validation("template name is required"));
    }
    if db::get_template_by_name(pool, name).await?.is_some() {
        return Err(SkeloError::validation(format!(
            "template {name:?} already exists"
        )));
    }

    let now = Utc::now();
    let template = Template {
        id: ids::new_id(),
        name: name.to_owned(),
        description: description.map(str::to_owned),
        template_type,
        definition: Json(definition),
        created_at: now,
        updated_at: now,
    };
    db::insert_template(pool, &template).await?;
    Ok(template)
}

/// Instantiate a template by name with the given variable bindings.
pub async fn instantiate(
    pool: &SqlitePool,
    name: &str,
    vars: &HashMap<String, String>,
) -> Result<InstantiationResult, SkeloError> {
    let template = db::get_template_by_name(pool, name)
        .await?
        .ok_or_else(|| SkeloError::not_found(format!("template {name:?}")))?;

    let definition = substitute_value(&template.definition.0, vars)?;

    match template.template_type {
        TemplateType::Task => {
            let input: CreateTaskInput = serde_json::from_value(definition).map_err(|e| {
                SkeloError::validation(format!("template {name:?} has an invalid task definition: {e}"))
            })?;
            let task = store::create(pool, &input).await?;
            Ok(InstantiationResult::Task(task))
        }
        TemplateType::Pipeline => {
            let input: CreateDagPipelineInput =
                serde_json::from_value(definition).map_err(|e| {
                    SkeloError::validation(format!(
                        "template {name:?} has an invalid pipeline definition: {e}"
                    ))
                })?;
            let (pipeline_id, tasks) = pipeline::create_dag_pipeline(pool, &input).await?;
            Ok(InstantiationResult::Pipeline { pipeline_id, tasks })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn substitutes_bound_variable() {
        let out = substitute("fix {{component}} now", &vars(&[("component", "parser")]))
            .expect("should substitute");
        assert_eq!(out, "fix parser now");
    }

    #[test]
    fn default_used_when_unbound() {
        let out = substitute("priority {{level:-low}}", &vars(&[])).expect("should substitute");
        assert_eq!(out, "priority low");
    }

    #[test]
    fn binding_beats_default() {
        let out = substitute("priority {{level:-low}}", &vars(&[("level", "high")]))
            .expect("should substitute");
        assert_eq!(out, "priority high");
    }

    #[test]
    fn empty_default_is_allowed() {
        let out = substitute("x{{gone:-}}y", &vars(&[])).expect("should substitute");
        assert_eq!(out, "xy");
    }

    #[test]
    fn missing_variable_without_default_errors() {
        let err = substitute("fix {{component}}", &vars(&[])).unwrap_err();
        assert!(err.to_string().contains("component"), "{err}");
    }

    #[test]
    fn multiple_placeholders() {
        let out = substitute(
            "{{a}} and {{b}} and {{a}}",
            &vars(&[("a", "1"), ("b", "2")]),
        )
        .expect("should substitute");
        assert_eq!(out, "1 and 2 and 1");
    }

    #[test]
    fn substitutes_through_json() {
        let value = serde_json::json!({
            "summary": "build {{thing}}",
            "nested": {"items": ["{{thing}}", "static"]},
            "count": 3
        });
        let out = substitute_value(&value, &vars(&[("thing", "widget")]))
            .expect("should substitute");
        assert_eq!(out["summary"], "build widget");
        assert_eq!(out["nested"]["items"][0], "widget");
        assert_eq!(out["count"], 3);
    }
}
