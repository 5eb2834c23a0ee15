//! Execution log table operations.
//!
//! The only writer is the worker's stream flusher; sequence numbers are
//! assigned dense-from-0 in stream order at flush time. Reads filter
//! admin-only levels (`debug`, `traceback`) for non-admin principals.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bfr_schemas::LogLevel;

use crate::executions::Principal;

#[derive(Debug, Clone)]
pub struct ExecutionLogRow {
    pub sequence: i32,
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<Value>,
}

/// One entry as drained from the Redis log stream.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<Value>,
}

/// Mirror a drained log stream into the durable table. Sequences continue
/// from the current max so a partial earlier flush never produces gaps or
/// duplicate keys.
pub async fn insert_execution_logs(
    pool: &PgPool,
    execution_id: Uuid,
    entries: &[NewLogEntry],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let (start,): (i32,) = sqlx::query_as::<_, (i32,)>(
        "select coalesce(max(sequence) + 1, 0) from execution_logs where execution_id = $1",
    )
    .bind(execution_id)
    .fetch_one(pool)
    .await
    .context("log sequence query failed")?;

    for (idx, entry) in entries.iter().enumerate() {
        sqlx::query(
            r#"
            insert into execution_logs (execution_id, sequence, timestamp, level, message, metadata)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (execution_id, sequence) do nothing
            "#,
        )
        .bind(execution_id)
        .bind(start + idx as i32)
        .bind(entry.timestamp)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .execute(pool)
        .await
        .context("insert_execution_logs failed")?;
    }
    Ok(())
}

/// Fetch logs ordered by sequence. Non-admins get `debug`/`traceback`
/// entries stripped.
pub async fn fetch_execution_logs(
    pool: &PgPool,
    execution_id: Uuid,
    principal: &Principal,
) -> Result<Vec<ExecutionLogRow>> {
    let rows = sqlx::query(
        r#"
        select sequence, timestamp, level, message, metadata
        from execution_logs
        where execution_id = $1
          and ($2 or level not in ('debug', 'traceback'))
        order by sequence
        "#,
    )
    .bind(execution_id)
    .bind(principal.is_admin)
    .fetch_all(pool)
    .await
    .context("fetch_execution_logs failed")?;

    rows.iter()
        .map(|row| {
            let level: String = row.try_get("level")?;
            Ok(ExecutionLogRow {
                sequence: row.try_get("sequence")?,
                timestamp: row.try_get("timestamp")?,
                level: LogLevel::parse_lenient(&level),
                message: row.try_get("message")?,
                metadata: row.try_get("metadata")?,
            })
        })
        .collect()
}
