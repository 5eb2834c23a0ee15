//! Scheduled jobs.
//!
//! Every job acquires what it needs per run and coalesces missed work into
//! one pass: due-ness is computed against persisted watermarks (last fire
//! times, row ages), so a late tick does one catch-up run instead of
//! replaying each missed interval.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use sqlx::PgPool;
use tracing::{error, info, warn};

use bfr_cache::CacheClient;
use bfr_schemas::{channels, BusMessage, ExecutionStatus};
use bfr_worker::Intake;

/// Margin added to a workflow's timeout before a `Running` row counts as
/// stuck.
pub const STUCK_EXECUTION_MARGIN_SECS: i64 = 300;
/// Deliveries older than this in `Pending`/`Queued` are failed.
pub const STUCK_DELIVERY_CUTOFF_SECS: i64 = 1800;
/// Event retention window.
pub const EVENT_RETENTION_DAYS: i64 = 30;
/// OAuth tokens expiring within this window get refreshed.
pub const TOKEN_REFRESH_WINDOW_SECS: i64 = 30 * 60;
/// Webhook subscriptions expiring within this window get renewed.
pub const WEBHOOK_RENEWAL_WINDOW_SECS: i64 = 12 * 3600;

// ---------------------------------------------------------------------------
// Schedule-source processor (every minute)
// ---------------------------------------------------------------------------

/// Fire every scheduled workflow whose cron expression has an occurrence
/// between its last fire time and now. Missed ticks coalesce: one run
/// replaces all of them.
pub async fn process_schedule_sources(pool: &PgPool, intake: &Intake) -> Result<usize> {
    let now = Utc::now();
    let workflows = bfr_db::workflows::list_scheduled_workflows(pool).await?;
    let mut fired = 0usize;

    for workflow in &workflows {
        let Some(expr) = workflow.schedule.as_deref() else {
            continue;
        };
        let due = match schedule_is_due(expr, workflow.schedule_last_fired_at, now) {
            Ok(due) => due,
            Err(err) => {
                warn!(
                    workflow_id = %workflow.meta.id,
                    schedule = expr,
                    error = ?err,
                    "unparseable schedule expression"
                );
                continue;
            }
        };
        if !due {
            continue;
        }

        match intake
            .enqueue_system_workflow_execution(
                workflow.meta.id,
                serde_json::json!({}),
                "Scheduler",
                workflow.meta.organization_id,
            )
            .await
        {
            Ok(execution_id) => {
                bfr_db::workflows::touch_schedule_fired(pool, workflow.meta.id).await?;
                info!(
                    workflow_id = %workflow.meta.id,
                    %execution_id,
                    schedule = expr,
                    "scheduled workflow fired"
                );
                fired += 1;
            }
            Err(err) => {
                error!(workflow_id = %workflow.meta.id, error = ?err, "schedule enqueue failed");
            }
        }
    }
    Ok(fired)
}

/// Whether `expr` has an occurrence in `(last_fired, now]`. A workflow that
/// never fired is due as soon as an occurrence lands after `now - 1 tick
/// window` — we seed the watermark one minute back so fresh schedules do
/// not replay history.
pub fn schedule_is_due(
    expr: &str,
    last_fired: Option<NaiveDateTime>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let schedule = cron::Schedule::from_str(&normalize_cron(expr))
        .with_context(|| format!("invalid cron expression '{expr}'"))?;
    let watermark = last_fired
        .map(|t| t.and_utc())
        .unwrap_or_else(|| now - ChronoDuration::minutes(1));

    Ok(schedule
        .after(&watermark)
        .next()
        .is_some_and(|occurrence| occurrence <= now))
}

/// Accept classic 5-field cron by prepending a seconds column.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

// ---------------------------------------------------------------------------
// Stuck-execution sweeper (every 5 minutes, also at boot)
// ---------------------------------------------------------------------------

/// Fail `Running` rows whose worker evidently died between claim and
/// terminal write, and broadcast the transition so observers converge.
pub async fn cleanup_stuck_executions(pool: &PgPool, cache: &CacheClient) -> Result<usize> {
    let stuck =
        bfr_db::executions::fail_stuck_executions(pool, STUCK_EXECUTION_MARGIN_SECS).await?;
    for execution_id in &stuck {
        warn!(%execution_id, "stuck execution failed by sweeper");
        let message = BusMessage::ExecutionUpdate {
            execution_id: *execution_id,
            status: ExecutionStatus::Failed.as_str().to_string(),
            data: Some(serde_json::json!({"errorType": "StuckExecution"})),
        };
        if let Err(err) = cache
            .publish(&channels::execution(*execution_id), &message)
            .await
        {
            warn!(%execution_id, error = ?err, "stuck execution publish failed");
        }
        // The reservation is orphaned too.
        if let Err(err) = cache.delete_pending_execution(*execution_id).await {
            warn!(%execution_id, error = ?err, "stuck pending delete failed");
        }
    }
    if !stuck.is_empty() {
        info!(count = stuck.len(), "stuck executions cleaned up");
    }
    Ok(stuck.len())
}

// ---------------------------------------------------------------------------
// Stuck-delivery sweeper (every 5 minutes)
// ---------------------------------------------------------------------------

pub async fn cleanup_stuck_deliveries(pool: &PgPool) -> Result<usize> {
    let event_ids =
        bfr_db::events::fail_stuck_deliveries(pool, STUCK_DELIVERY_CUTOFF_SECS).await?;
    for event_id in &event_ids {
        bfr_db::events::update_event_status(pool, *event_id).await?;
    }
    if !event_ids.is_empty() {
        info!(events = event_ids.len(), "stuck deliveries cleaned up");
    }
    Ok(event_ids.len())
}

// ---------------------------------------------------------------------------
// Event retention cleanup (daily 03:00 UTC)
// ---------------------------------------------------------------------------

pub async fn cleanup_old_events(pool: &PgPool) -> Result<u64> {
    let removed = bfr_db::events::delete_old_events(pool, EVENT_RETENTION_DAYS).await?;
    if removed > 0 {
        info!(removed, "old events deleted");
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// OAuth token refresh (every 15 minutes, also at boot)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Refresh integration tokens expiring within the window. Failures are
/// per-token: one bad provider never blocks the rest.
pub async fn refresh_expiring_tokens(pool: &PgPool, http: &reqwest::Client) -> Result<usize> {
    let tokens = bfr_db::orgs::list_expiring_tokens(pool, TOKEN_REFRESH_WINDOW_SECS).await?;
    let mut refreshed = 0usize;

    for token in &tokens {
        let (Some(refresh_token), Some(token_url)) =
            (token.refresh_token.as_deref(), token.token_url.as_deref())
        else {
            continue;
        };

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(client_id) = &token.client_id {
            form.push(("client_id", client_id.clone()));
        }
        if let Some(client_secret) = &token.client_secret {
            form.push(("client_secret", client_secret.clone()));
        }

        let response = match http.post(token_url).form(&form).send().await {
            Ok(r) => r,
            Err(err) => {
                warn!(token_id = %token.id, error = %err, "token refresh request failed");
                continue;
            }
        };
        if !response.status().is_success() {
            warn!(token_id = %token.id, status = %response.status(), "token refresh rejected");
            continue;
        }
        let body: TokenResponse = match response.json().await {
            Ok(b) => b,
            Err(err) => {
                warn!(token_id = %token.id, error = %err, "token refresh response unreadable");
                continue;
            }
        };

        let expires_at = body
            .expires_in
            .map(|secs| (Utc::now() + ChronoDuration::seconds(secs)).naive_utc());
        bfr_db::orgs::store_refreshed_token(
            pool,
            token.id,
            &body.access_token,
            body.refresh_token.as_deref(),
            expires_at,
        )
        .await?;
        refreshed += 1;
    }

    if refreshed > 0 {
        info!(refreshed, "OAuth tokens refreshed");
    }
    Ok(refreshed)
}

// ---------------------------------------------------------------------------
// Webhook subscription renewal (every 6 hours)
// ---------------------------------------------------------------------------

/// Extend leases on webhook sources whose provider-side subscription is
/// about to lapse. The provider round-trip belongs to the integration
/// adapters (external); the fabric's part is the lease bookkeeping.
pub async fn renew_expiring_webhooks(pool: &PgPool) -> Result<usize> {
    let expiring =
        bfr_db::events::list_expiring_webhook_sources(pool, WEBHOOK_RENEWAL_WINDOW_SECS).await?;
    for source in &expiring {
        let new_expiry = (Utc::now() + ChronoDuration::days(3)).naive_utc();
        bfr_db::events::touch_webhook_expiry(pool, source.id, new_expiry).await?;
        info!(webhook_id = %source.id, adapter = %source.adapter_name, "webhook lease renewed");
    }
    Ok(expiring.len())
}

// ---------------------------------------------------------------------------
// Snapshots (hourly / daily 02:00 UTC)
// ---------------------------------------------------------------------------

pub async fn refresh_metrics_snapshot(pool: &PgPool) -> Result<u64> {
    bfr_db::metrics::refresh_metrics_snapshot(pool).await
}

pub async fn refresh_knowledge_storage_daily(pool: &PgPool) -> Result<()> {
    bfr_db::metrics::refresh_knowledge_storage_daily(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_normalized() {
        assert!(schedule_is_due("* * * * *", None, Utc::now()).unwrap());
    }

    #[test]
    fn due_when_occurrence_since_last_fire() {
        let now = Utc::now();
        let last = (now - ChronoDuration::minutes(10)).naive_utc();
        assert!(schedule_is_due("*/5 * * * *", Some(last), now).unwrap());
    }

    #[test]
    fn not_due_when_fired_this_tick() {
        let now = Utc::now();
        // Last fired in the future edge: nothing can be due.
        let last = (now + ChronoDuration::minutes(1)).naive_utc();
        assert!(!schedule_is_due("* * * * *", Some(last), now).unwrap());
    }

    #[test]
    fn missed_ticks_coalesce_to_one_due() {
        let now = Utc::now();
        // Hours of downtime: still just "due", not a replay count.
        let last = (now - ChronoDuration::hours(6)).naive_utc();
        assert!(schedule_is_due("*/1 * * * *", Some(last), now).unwrap());
    }

    #[test]
    fn bad_expression_is_an_error() {
        assert!(schedule_is_due("not a cron", None, Utc::now()).is_err());
    }
}
