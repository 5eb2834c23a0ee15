//! Execution table operations.
//!
//! Writers are the worker (create + one terminal update per execution) and
//! the surface's cancel path. Readers enforce admin gating here: non-admins
//! never see `variables`, resource metrics, or the raw message of a
//! non-`UserError` failure.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bfr_schemas::{ExecutionStatus, ResourceMetrics, ResultKind};

/// Message shown to non-admins in place of any non-`UserError` failure.
pub const REDACTED_ERROR: &str = "An error occurred during execution";

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Caller identity for read-side authorization. The real principal comes
/// from the external auth collaborator; the fabric only needs these two
/// facts.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: Uuid,
    pub is_admin: bool,
}

// ---------------------------------------------------------------------------
// Create / update (worker paths)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub parameters: Value,
    pub org_id: Option<Uuid>,
    pub user_id: Uuid,
    pub user_name: String,
    pub form_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub status: ExecutionStatus,
}

/// Insert the execution row when the worker claims the message. `started_at`
/// is stamped here; the terminal update computes duration against it.
pub async fn create_execution(pool: &PgPool, new: &NewExecution) -> Result<()> {
    sqlx::query(
        r#"
        insert into executions (
          id, workflow_name, status, parameters, executed_by, executed_by_name,
          organization_id, form_id, api_key_id, started_at
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
        )
        "#,
    )
    .bind(new.execution_id)
    .bind(&new.workflow_name)
    .bind(new.status.as_str())
    .bind(&new.parameters)
    .bind(new.user_id)
    .bind(&new.user_name)
    .bind(new.org_id)
    .bind(new.form_id)
    .bind(new.api_key_id)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await
    .context("create_execution failed")?;
    Ok(())
}

/// Everything a terminal write can carry. Logs are deliberately absent: the
/// Redis stream is the single source of truth and only the flusher writes
/// `execution_logs`.
#[derive(Debug, Clone, Default)]
pub struct TerminalUpdate {
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub variables: Option<Value>,
    pub metrics: Option<ResourceMetrics>,
    pub time_saved: Option<i32>,
    pub value: Option<f64>,
}

/// Apply the one terminal update for an execution. `completed_at` is
/// stamped whenever a duration is supplied.
pub async fn update_execution(
    pool: &PgPool,
    execution_id: Uuid,
    status: ExecutionStatus,
    upd: &TerminalUpdate,
) -> Result<()> {
    let result_type = upd.result.as_ref().map(|v| ResultKind::infer(v).as_str());
    let completed_at = upd.duration_ms.map(|_| Utc::now().naive_utc());
    let m = upd.metrics.unwrap_or_default();

    sqlx::query(
        r#"
        update executions set
          status = $2,
          result = coalesce($3, result),
          result_type = coalesce($4, result_type),
          error_message = coalesce($5, error_message),
          error_type = coalesce($6, error_type),
          duration_ms = coalesce($7, duration_ms),
          completed_at = coalesce($8, completed_at),
          variables = coalesce($9, variables),
          peak_memory_bytes = coalesce($10, peak_memory_bytes),
          cpu_user_seconds = coalesce($11, cpu_user_seconds),
          cpu_system_seconds = coalesce($12, cpu_system_seconds),
          cpu_total_seconds = coalesce($13, cpu_total_seconds),
          time_saved = coalesce($14, time_saved),
          value = coalesce($15, value)
        where id = $1
        "#,
    )
    .bind(execution_id)
    .bind(status.as_str())
    .bind(&upd.result)
    .bind(result_type)
    .bind(&upd.error_message)
    .bind(&upd.error_type)
    .bind(upd.duration_ms)
    .bind(completed_at)
    .bind(&upd.variables)
    .bind(m.peak_memory_bytes)
    .bind(m.cpu_user_seconds)
    .bind(m.cpu_system_seconds)
    .bind(m.cpu_total_seconds)
    .bind(upd.time_saved)
    .bind(upd.value)
    .execute(pool)
    .await
    .context("update_execution failed")?;
    Ok(())
}

/// Flip a `Pending` or `Running` row to `Cancelling`. Returns false when the
/// row is missing or already terminal.
pub async fn mark_cancelling(pool: &PgPool, execution_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update executions
        set status = $2
        where id = $1 and status in ('Pending', 'Running')
        "#,
    )
    .bind(execution_id)
    .bind(ExecutionStatus::Cancelling.as_str())
    .execute(pool)
    .await
    .context("mark_cancelling failed")?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub parameters: Value,
    pub result: Option<Value>,
    pub result_type: Option<String>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub variables: Option<Value>,
    pub peak_memory_bytes: Option<i64>,
    pub cpu_total_seconds: Option<f64>,
    pub executed_by: Uuid,
    pub executed_by_name: Option<String>,
    pub form_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ExecutionRow> {
    let status: String = row.try_get("status")?;
    Ok(ExecutionRow {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        workflow_name: row.try_get("workflow_name")?,
        status: ExecutionStatus::parse(&status)
            .with_context(|| format!("invalid execution status in DB: {status}"))?,
        parameters: row.try_get("parameters")?,
        result: row.try_get("result")?,
        result_type: row.try_get("result_type")?,
        error_message: row.try_get("error_message")?,
        error_type: row.try_get("error_type")?,
        duration_ms: row.try_get::<Option<i32>, _>("duration_ms")?.map(i64::from),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        variables: row.try_get("variables")?,
        peak_memory_bytes: row.try_get("peak_memory_bytes")?,
        cpu_total_seconds: row.try_get("cpu_total_seconds")?,
        executed_by: row.try_get("executed_by")?,
        executed_by_name: row.try_get("executed_by_name")?,
        form_id: row.try_get("form_id")?,
        api_key_id: row.try_get("api_key_id")?,
    })
}

const EXECUTION_COLUMNS: &str = r#"
    id, organization_id, workflow_name, status, parameters, result,
    result_type, error_message, error_type, duration_ms, started_at,
    completed_at, variables, peak_memory_bytes, cpu_total_seconds,
    executed_by, executed_by_name, form_id, api_key_id
"#;

/// Fetch one execution with authorization and admin gating applied.
/// Returns `Ok(None)` for missing rows; `Err` carries "Forbidden" context
/// when the caller may not see the row.
pub async fn get_execution(
    pool: &PgPool,
    execution_id: Uuid,
    principal: &Principal,
) -> Result<Option<ExecutionRow>> {
    let row = sqlx::query(&format!(
        "select {EXECUTION_COLUMNS} from executions where id = $1"
    ))
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .context("get_execution failed")?;

    let Some(row) = row else { return Ok(None) };
    let mut exec = row_to_execution(&row)?;

    if !principal.is_admin && exec.executed_by != principal.user_id {
        anyhow::bail!("Forbidden");
    }

    if !principal.is_admin {
        redact_for_non_admin(&mut exec);
    }
    Ok(Some(exec))
}

/// Strip admin-only material. `UserError` messages pass through; every other
/// error kind is replaced with the generic message.
pub fn redact_for_non_admin(exec: &mut ExecutionRow) {
    exec.variables = None;
    exec.peak_memory_bytes = None;
    exec.cpu_total_seconds = None;
    if exec.error_message.is_some() && exec.error_type.as_deref() != Some("UserError") {
        exec.error_message = Some(REDACTED_ERROR.to_string());
    }
}

/// Filters for execution listing.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub org_id: Option<Uuid>,
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// List executions newest-first with a continuation token (offset of the
/// next page, `None` when exhausted). Non-admins only see their own rows.
pub async fn list_executions(
    pool: &PgPool,
    principal: &Principal,
    filter: &ExecutionFilter,
) -> Result<(Vec<ExecutionRow>, Option<i64>)> {
    let limit = if filter.limit <= 0 { 25 } else { filter.limit };

    let rows = sqlx::query(&format!(
        r#"
        select {EXECUTION_COLUMNS} from executions
        where ($1::uuid is null or organization_id = $1)
          and ($2::uuid is null or executed_by = $2)
          and ($3::text is null or workflow_name = $3)
          and ($4::text is null or status = $4)
          and ($5::timestamp is null or started_at >= $5)
          and ($6::timestamp is null or started_at <= $6)
        order by started_at desc nulls last
        offset $7 limit $8
        "#
    ))
    .bind(filter.org_id)
    .bind((!principal.is_admin).then_some(principal.user_id))
    .bind(&filter.workflow_name)
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.started_after.map(|t| t.naive_utc()))
    .bind(filter.started_before.map(|t| t.naive_utc()))
    .bind(filter.offset)
    .bind(limit + 1) // +1 to detect a next page
    .fetch_all(pool)
    .await
    .context("list_executions failed")?;

    let mut executions = rows
        .iter()
        .map(row_to_execution)
        .collect::<Result<Vec<_>>>()?;

    let next_offset = if executions.len() as i64 > limit {
        executions.truncate(limit as usize);
        Some(filter.offset + limit)
    } else {
        None
    };

    if !principal.is_admin {
        for e in &mut executions {
            redact_for_non_admin(e);
        }
    }
    Ok((executions, next_offset))
}

/// Result-only fetch (surface convenience endpoint).
pub async fn get_execution_result(
    pool: &PgPool,
    execution_id: Uuid,
    principal: &Principal,
) -> Result<Option<(Option<Value>, Option<String>)>> {
    let row = sqlx::query("select result, result_type, executed_by from executions where id = $1")
        .bind(execution_id)
        .fetch_optional(pool)
        .await
        .context("get_execution_result failed")?;

    let Some(row) = row else { return Ok(None) };
    let executed_by: Uuid = row.try_get("executed_by")?;
    if !principal.is_admin && executed_by != principal.user_id {
        anyhow::bail!("Forbidden");
    }
    Ok(Some((row.try_get("result")?, row.try_get("result_type")?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_row(error_type: &str) -> ExecutionRow {
        ExecutionRow {
            id: Uuid::nil(),
            organization_id: None,
            workflow_name: "wf".to_string(),
            status: ExecutionStatus::Failed,
            parameters: Value::Null,
            result: None,
            result_type: None,
            error_message: Some("raw detail".to_string()),
            error_type: Some(error_type.to_string()),
            duration_ms: Some(1),
            started_at: None,
            completed_at: None,
            variables: Some(Value::Bool(true)),
            peak_memory_bytes: Some(1024),
            cpu_total_seconds: Some(0.5),
            executed_by: Uuid::nil(),
            executed_by_name: None,
            form_id: None,
            api_key_id: None,
        }
    }

    #[test]
    fn user_error_message_survives_redaction() {
        let mut row = failed_row("UserError");
        redact_for_non_admin(&mut row);
        assert_eq!(row.error_message.as_deref(), Some("raw detail"));
        assert!(row.variables.is_none());
        assert!(row.peak_memory_bytes.is_none());
        assert!(row.cpu_total_seconds.is_none());
    }

    #[test]
    fn other_errors_are_replaced_with_the_generic_message() {
        for kind in ["InternalError", "TimeoutError", "WorkflowLoadError"] {
            let mut row = failed_row(kind);
            redact_for_non_admin(&mut row);
            assert_eq!(row.error_message.as_deref(), Some(REDACTED_ERROR));
        }
    }
}

/// Sweep `Running` rows whose workflow timeout (plus margin) has long since
/// expired — evidence of a worker crash between claim and terminal write.
/// Each becomes `Failed` with `error_type = 'StuckExecution'`. Returns the
/// number of rows transitioned.
pub async fn fail_stuck_executions(pool: &PgPool, margin_seconds: i64) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        update executions e
        set status = 'Failed',
            error_message = 'Execution exceeded its timeout without a terminal update',
            error_type = 'StuckExecution',
            completed_at = (now() at time zone 'utc'),
            duration_ms = (extract(epoch from ((now() at time zone 'utc') - e.started_at)) * 1000)::int
        where e.status = 'Running'
          and e.started_at is not null
          and e.started_at < (now() at time zone 'utc')
              - make_interval(secs => coalesce(
                    (select w.timeout_seconds from workflows w where w.name = e.workflow_name
                     order by w.is_active desc limit 1),
                    1800
                ) + $1)
        returning id
        "#,
    )
    .bind(margin_seconds as f64)
    .fetch_all(pool)
    .await
    .context("fail_stuck_executions failed")?;

    rows.iter()
        .map(|r| r.try_get::<Uuid, _>("id").map_err(Into::into))
        .collect()
}
