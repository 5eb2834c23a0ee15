//! Workflow table reads.
//!
//! The fabric never mutates workflow rows (the file-index collaborator owns
//! them) except for `schedule_last_fired_at`, which the schedule-source
//! processor advances.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bfr_schemas::WorkflowMetadata;

#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub meta: WorkflowMetadata,
    pub schedule: Option<String>,
    pub schedule_last_fired_at: Option<NaiveDateTime>,
}

fn row_to_metadata(row: &sqlx::postgres::PgRow) -> Result<WorkflowMetadata> {
    Ok(WorkflowMetadata {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        function_name: row.try_get("function_name")?,
        file_path: row.try_get("file_path")?,
        timeout_seconds: row.try_get::<i32, _>("timeout_seconds")? as u32,
        time_saved: row.try_get("time_saved")?,
        value: row.try_get("value")?,
        execution_mode: row.try_get("execution_mode")?,
        organization_id: row.try_get("organization_id")?,
    })
}

/// Metadata-only lookup of one active workflow. Returns `Ok(None)` for
/// unknown or deactivated ids — the caller decides whether that is a
/// `WorkflowNotFound` terminal path.
pub async fn fetch_workflow_metadata(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Option<WorkflowMetadata>> {
    let row = sqlx::query(
        r#"
        select id, name, function_name, file_path, timeout_seconds,
               time_saved, value, execution_mode, organization_id
        from workflows
        where id = $1 and is_active
        "#,
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await
    .context("fetch_workflow_metadata failed")?;

    row.as_ref().map(row_to_metadata).transpose()
}

/// Fetch the stored code blob for a workflow (may be absent for file-backed
/// workflows).
pub async fn fetch_workflow_code(pool: &PgPool, workflow_id: Uuid) -> Result<Option<String>> {
    let row = sqlx::query("select code from workflows where id = $1")
        .bind(workflow_id)
        .fetch_optional(pool)
        .await
        .context("fetch_workflow_code failed")?;
    Ok(row.and_then(|r| r.try_get::<Option<String>, _>("code").ok().flatten()))
}

/// All active workflows carrying a schedule expression, with their last
/// fire time (the schedule-source processor computes due-ness from it).
pub async fn list_scheduled_workflows(pool: &PgPool) -> Result<Vec<WorkflowRow>> {
    let rows = sqlx::query(
        r#"
        select id, name, function_name, file_path, timeout_seconds,
               time_saved, value, execution_mode, organization_id,
               schedule, schedule_last_fired_at
        from workflows
        where is_active and schedule is not null
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_scheduled_workflows failed")?;

    rows.iter()
        .map(|row| {
            Ok(WorkflowRow {
                meta: row_to_metadata(row)?,
                schedule: row.try_get("schedule")?,
                schedule_last_fired_at: row.try_get("schedule_last_fired_at")?,
            })
        })
        .collect()
}

/// Record that a scheduled workflow fired (coalescing any missed ticks).
pub async fn touch_schedule_fired(pool: &PgPool, workflow_id: Uuid) -> Result<()> {
    sqlx::query(
        "update workflows set schedule_last_fired_at = (now() at time zone 'utc') where id = $1",
    )
    .bind(workflow_id)
    .execute(pool)
    .await
    .context("touch_schedule_fired failed")?;
    Ok(())
}

/// Distinct (provider, model) pairs observed in usage rows; used to
/// repopulate the Redis used-models set on cold start.
pub async fn distinct_used_models(pool: &PgPool) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query("select distinct provider, model from ai_usage")
        .fetch_all(pool)
        .await
        .context("distinct_used_models failed")?;
    rows.iter()
        .map(|r| Ok((r.try_get("provider")?, r.try_get("model")?)))
        .collect()
}

/// Pricing probe backing the negative-capable pricing cache.
pub async fn fetch_model_pricing(
    pool: &PgPool,
    provider: &str,
    model: &str,
) -> Result<Option<(f64, f64)>> {
    let row = sqlx::query(
        r#"
        select input_price_per_mtok, output_price_per_mtok
        from ai_model_pricing
        where provider = $1 and model = $2
        "#,
    )
    .bind(provider)
    .bind(model)
    .fetch_optional(pool)
    .await
    .context("fetch_model_pricing failed")?;
    row.map(|r| {
        Ok((
            r.try_get("input_price_per_mtok")?,
            r.try_get("output_price_per_mtok")?,
        ))
    })
    .transpose()
}

/// requirements.txt content from the file-index mirror; `Ok(None)` when the
/// file has never been indexed.
pub async fn fetch_platform_file(pool: &PgPool, path: &str) -> Result<Option<String>> {
    let row = sqlx::query("select content from platform_files where path = $1")
        .bind(path)
        .fetch_optional(pool)
        .await
        .context("fetch_platform_file failed")?;
    Ok(row.and_then(|r| r.try_get::<String, _>("content").ok()))
}

/// Write-through side of the requirements cache: upsert the file row.
pub async fn upsert_platform_file(pool: &PgPool, path: &str, content: &str) -> Result<()> {
    sqlx::query(
        r#"
        insert into platform_files (path, content, updated_at)
        values ($1, $2, (now() at time zone 'utc'))
        on conflict (path) do update
          set content = excluded.content, updated_at = excluded.updated_at
        "#,
    )
    .bind(path)
    .bind(content)
    .execute(pool)
    .await
    .context("upsert_platform_file failed")?;
    Ok(())
}
