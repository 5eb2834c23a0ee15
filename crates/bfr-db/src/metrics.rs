//! Daily aggregate upserts feeding the dashboards.
//!
//! The worker bumps these after every terminal success path; the scheduler's
//! snapshot job recomputes today's rows wholesale so drift from missed bumps
//! heals within the hour.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use bfr_schemas::{ExecutionStatus, ResourceMetrics};

/// Nil UUID standing in for the global scope in aggregate keys.
const GLOBAL_ORG: Uuid = Uuid::nil();

/// Bump today's per-organization aggregate with one finished execution.
#[allow(clippy::too_many_arguments)]
pub async fn update_daily_metrics(
    pool: &PgPool,
    org_id: Option<Uuid>,
    status: ExecutionStatus,
    duration_ms: i64,
    metrics: Option<&ResourceMetrics>,
    time_saved: i32,
    value: f64,
) -> Result<()> {
    let succeeded = i32::from(status == ExecutionStatus::Success);
    let failed = i32::from(status != ExecutionStatus::Success);
    let peak = metrics.and_then(|m| m.peak_memory_bytes);
    let cpu = metrics.and_then(|m| m.cpu_total_seconds).unwrap_or(0.0);

    sqlx::query(
        r#"
        insert into daily_metrics (
          day, organization_id, executions_total, executions_succeeded,
          executions_failed, duration_ms_total, peak_memory_bytes_max,
          cpu_seconds_total, time_saved_total, value_total
        ) values (
          current_date, $1, 1, $2, $3, $4, $5, $6, $7, $8
        )
        on conflict (day, organization_id) do update set
          executions_total = daily_metrics.executions_total + 1,
          executions_succeeded = daily_metrics.executions_succeeded + excluded.executions_succeeded,
          executions_failed = daily_metrics.executions_failed + excluded.executions_failed,
          duration_ms_total = daily_metrics.duration_ms_total + excluded.duration_ms_total,
          peak_memory_bytes_max = greatest(daily_metrics.peak_memory_bytes_max, excluded.peak_memory_bytes_max),
          cpu_seconds_total = daily_metrics.cpu_seconds_total + excluded.cpu_seconds_total,
          time_saved_total = daily_metrics.time_saved_total + excluded.time_saved_total,
          value_total = daily_metrics.value_total + excluded.value_total
        "#,
    )
    .bind(org_id.unwrap_or(GLOBAL_ORG))
    .bind(succeeded)
    .bind(failed)
    .bind(duration_ms)
    .bind(peak)
    .bind(cpu)
    .bind(time_saved)
    .bind(value)
    .execute(pool)
    .await
    .context("update_daily_metrics failed")?;
    Ok(())
}

/// Bump today's per-workflow ROI aggregate.
pub async fn update_workflow_roi_daily(
    pool: &PgPool,
    workflow_id: Uuid,
    org_id: Option<Uuid>,
    status: ExecutionStatus,
    time_saved: i32,
    value: f64,
) -> Result<()> {
    let succeeded = i32::from(status == ExecutionStatus::Success);

    sqlx::query(
        r#"
        insert into workflow_roi_daily (
          day, workflow_id, organization_id, executions_total,
          executions_succeeded, time_saved_total, value_total
        ) values (
          current_date, $1, $2, 1, $3, $4, $5
        )
        on conflict (day, workflow_id) do update set
          executions_total = workflow_roi_daily.executions_total + 1,
          executions_succeeded = workflow_roi_daily.executions_succeeded + excluded.executions_succeeded,
          time_saved_total = workflow_roi_daily.time_saved_total + excluded.time_saved_total,
          value_total = workflow_roi_daily.value_total + excluded.value_total
        "#,
    )
    .bind(workflow_id)
    .bind(org_id)
    .bind(succeeded)
    .bind(time_saved)
    .bind(value)
    .execute(pool)
    .await
    .context("update_workflow_roi_daily failed")?;
    Ok(())
}

/// Recompute today's per-organization rows from the executions table. The
/// hourly snapshot job runs this so the incremental bumps self-heal.
pub async fn refresh_metrics_snapshot(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        r#"
        insert into daily_metrics (
          day, organization_id, executions_total, executions_succeeded,
          executions_failed, duration_ms_total, peak_memory_bytes_max,
          cpu_seconds_total, time_saved_total, value_total
        )
        select
          current_date,
          coalesce(organization_id, '00000000-0000-0000-0000-000000000000'),
          count(*),
          count(*) filter (where status = 'Success'),
          count(*) filter (where status in ('Failed', 'Timeout', 'Cancelled')),
          coalesce(sum(duration_ms), 0),
          max(peak_memory_bytes),
          coalesce(sum(cpu_total_seconds), 0),
          coalesce(sum(time_saved), 0),
          coalesce(sum(value), 0)
        from executions
        where completed_at >= current_date
        group by coalesce(organization_id, '00000000-0000-0000-0000-000000000000')
        on conflict (day, organization_id) do update set
          executions_total = excluded.executions_total,
          executions_succeeded = excluded.executions_succeeded,
          executions_failed = excluded.executions_failed,
          duration_ms_total = excluded.duration_ms_total,
          peak_memory_bytes_max = excluded.peak_memory_bytes_max,
          cpu_seconds_total = excluded.cpu_seconds_total,
          time_saved_total = excluded.time_saved_total,
          value_total = excluded.value_total
        "#,
    )
    .execute(pool)
    .await
    .context("refresh_metrics_snapshot failed")?;
    Ok(res.rows_affected())
}

/// Daily knowledge-storage totals from the file-index mirror.
pub async fn refresh_knowledge_storage_daily(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        insert into knowledge_storage_daily (day, file_count, total_bytes)
        select current_date, count(*), coalesce(sum(length(content)), 0)
        from platform_files
        on conflict (day) do update set
          file_count = excluded.file_count,
          total_bytes = excluded.total_bytes
        "#,
    )
    .execute(pool)
    .await
    .context("refresh_knowledge_storage_daily failed")?;
    Ok(())
}
