//! Database query functions for the `templates` table.

use anyhow::{Context, Result};
use sqlx::sqlite::Sqlite;
use sqlx::{Executor, SqlitePool};

use crate::models::Template;

/// Insert a fully-formed template row. Fails if the name is taken.
pub async fn insert_template<'e, E>(ex: E, template: &Template) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO templates (id, name, description, template_type, definition, \
         created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.description)
    .bind(template.template_type)
    .bind(&template.definition)
    .bind(template.created_at)
    .bind(template.updated_at)
    .execute(ex)
    .await
    .context("failed to insert template")?;

    Ok(())
}

/// Fetch a template by ID.
pub async fn get_template(pool: &SqlitePool, id: &str) -> Result<Option<Template>> {
    let template = sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch template")?;

    Ok(template)
}

/// Fetch a template by its unique name.
pub async fn get_template_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Template>> {
    let template = sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch template by name")?;

    Ok(template)
}

/// List all templates, ordered by name.
pub async fn list_templates(pool: &SqlitePool) -> Result<Vec<Template>> {
    let templates =
        sqlx::query_as::<_, Template>("SELECT * FROM templates ORDER BY name ASC")
            .fetch_all(pool)
            .await
            .context("failed to list templates")?;

    Ok(templates)
}

/// Delete a template by ID. Returns the number of rows removed.
pub async fn delete_template(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM templates WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete template")?;

    Ok(result.rows_affected())
}
