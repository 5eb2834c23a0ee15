//! Event ingress tables: sources, subscriptions, events, deliveries.
//!
//! The event row and its delivery rows are created inside one transaction;
//! queueing happens strictly after commit so the rows are visible to any
//! worker that finishes fast enough to back-link an execution.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bfr_schemas::{DeliveryStatus, EventStatus};

// ---------------------------------------------------------------------------
// Sources & subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WebhookSourceRow {
    pub id: Uuid,
    pub event_source_id: Uuid,
    pub adapter_name: String,
    pub config: Value,
    pub state: Value,
    pub source_is_active: bool,
}

/// Webhook source joined with its event source's active bit.
pub async fn fetch_webhook_source(
    pool: &PgPool,
    event_source_id: Uuid,
) -> Result<Option<WebhookSourceRow>> {
    let row = sqlx::query(
        r#"
        select w.id, w.event_source_id, w.adapter_name, w.config, w.state,
               s.is_active as source_is_active
        from webhook_sources w
        join event_sources s on s.id = w.event_source_id
        where w.event_source_id = $1
        "#,
    )
    .bind(event_source_id)
    .fetch_optional(pool)
    .await
    .context("fetch_webhook_source failed")?;

    row.map(|r| {
        Ok(WebhookSourceRow {
            id: r.try_get("id")?,
            event_source_id: r.try_get("event_source_id")?,
            adapter_name: r.try_get("adapter_name")?,
            config: r.try_get("config")?,
            state: r.try_get("state")?,
            source_is_active: r.try_get("source_is_active")?,
        })
    })
    .transpose()
}

/// Persist adapter-managed mutable state after a handled request.
pub async fn store_webhook_state(pool: &PgPool, webhook_id: Uuid, state: &Value) -> Result<()> {
    sqlx::query("update webhook_sources set state = $2 where id = $1")
        .bind(webhook_id)
        .bind(state)
        .execute(pool)
        .await
        .context("store_webhook_state failed")?;
    Ok(())
}

/// Webhook sources whose subscription lease expires within the window
/// (renewal job input).
pub async fn list_expiring_webhook_sources(
    pool: &PgPool,
    within_seconds: i64,
) -> Result<Vec<WebhookSourceRow>> {
    let rows = sqlx::query(
        r#"
        select w.id, w.event_source_id, w.adapter_name, w.config, w.state,
               s.is_active as source_is_active
        from webhook_sources w
        join event_sources s on s.id = w.event_source_id
        where s.is_active
          and w.expires_at is not null
          and w.expires_at < (now() at time zone 'utc') + make_interval(secs => $1)
        "#,
    )
    .bind(within_seconds as f64)
    .fetch_all(pool)
    .await
    .context("list_expiring_webhook_sources failed")?;

    rows.iter()
        .map(|r| {
            Ok(WebhookSourceRow {
                id: r.try_get("id")?,
                event_source_id: r.try_get("event_source_id")?,
                adapter_name: r.try_get("adapter_name")?,
                config: r.try_get("config")?,
                state: r.try_get("state")?,
                source_is_active: r.try_get("source_is_active")?,
            })
        })
        .collect()
}

/// Extend a webhook source's subscription lease.
pub async fn touch_webhook_expiry(
    pool: &PgPool,
    webhook_id: Uuid,
    expires_at: NaiveDateTime,
) -> Result<()> {
    sqlx::query("update webhook_sources set expires_at = $2 where id = $1")
        .bind(webhook_id)
        .bind(expires_at)
        .execute(pool)
        .await
        .context("touch_webhook_expiry failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
}

/// Active subscriptions matching an event. A null `event_type` filter on
/// the subscription matches every type.
pub async fn list_matching_subscriptions(
    pool: &PgPool,
    event_source_id: Uuid,
    event_type: &str,
) -> Result<Vec<SubscriptionRow>> {
    let rows = sqlx::query(
        r#"
        select id, workflow_id
        from event_subscriptions
        where event_source_id = $1
          and is_active
          and (event_type is null or event_type = $2)
        "#,
    )
    .bind(event_source_id)
    .bind(event_type)
    .fetch_all(pool)
    .await
    .context("list_matching_subscriptions failed")?;

    rows.iter()
        .map(|r| {
            Ok(SubscriptionRow {
                id: r.try_get("id")?,
                workflow_id: r.try_get("workflow_id")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Events & deliveries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: Uuid,
    pub event_source_id: Uuid,
    pub event_type: String,
    pub headers: Value,
    pub data: Value,
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: Uuid,
    pub event_source_id: Uuid,
    pub event_type: String,
    pub received_at: NaiveDateTime,
    pub headers: Option<Value>,
    pub data: Option<Value>,
    pub source_ip: Option<String>,
    pub status: EventStatus,
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<EventRow> {
    let status: String = row.try_get("status")?;
    Ok(EventRow {
        id: row.try_get("id")?,
        event_source_id: row.try_get("event_source_id")?,
        event_type: row.try_get("event_type")?,
        received_at: row.try_get("received_at")?,
        headers: row.try_get("headers")?,
        data: row.try_get("data")?,
        source_ip: row.try_get("source_ip")?,
        status: EventStatus::parse(&status)
            .with_context(|| format!("invalid event status in DB: {status}"))?,
    })
}

/// Create the event row plus one `Pending` delivery per subscription, in a
/// single transaction. Events with no deliveries commit as `Completed`
/// (nothing to do); otherwise the event commits as `Processing`.
pub async fn create_event_with_deliveries(
    pool: &PgPool,
    new: &NewEvent,
    subscriptions: &[SubscriptionRow],
) -> Result<EventRow> {
    let mut tx = pool.begin().await.context("begin event transaction")?;

    let with_workflow: Vec<&SubscriptionRow> = subscriptions
        .iter()
        .filter(|s| s.workflow_id.is_some())
        .collect();

    let status = if with_workflow.is_empty() {
        EventStatus::Completed
    } else {
        EventStatus::Processing
    };
    let received_at = Utc::now().naive_utc();

    sqlx::query(
        r#"
        insert into events (id, event_source_id, event_type, received_at, headers, data, source_ip, status)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(new.id)
    .bind(new.event_source_id)
    .bind(&new.event_type)
    .bind(received_at)
    .bind(&new.headers)
    .bind(&new.data)
    .bind(&new.source_ip)
    .bind(status.as_str())
    .execute(&mut *tx)
    .await
    .context("insert event failed")?;

    for sub in &with_workflow {
        sqlx::query(
            r#"
            insert into event_deliveries (id, event_id, event_subscription_id, workflow_id, status)
            values ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.id)
        .bind(sub.id)
        .bind(sub.workflow_id)
        .bind(DeliveryStatus::Pending.as_str())
        .execute(&mut *tx)
        .await
        .context("insert delivery failed")?;
    }

    tx.commit().await.context("commit event transaction")?;

    Ok(EventRow {
        id: new.id,
        event_source_id: new.event_source_id,
        event_type: new.event_type.clone(),
        received_at,
        headers: Some(new.headers.clone()),
        data: Some(new.data.clone()),
        source_ip: new.source_ip.clone(),
        status,
    })
}

pub async fn fetch_event(pool: &PgPool, event_id: Uuid) -> Result<Option<EventRow>> {
    let row = sqlx::query(
        r#"
        select id, event_source_id, event_type, received_at, headers, data, source_ip, status
        from events where id = $1
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("fetch_event failed")?;
    row.as_ref().map(row_to_event).transpose()
}

#[derive(Debug, Clone)]
pub struct DeliveryRow {
    pub id: Uuid,
    pub event_id: Uuid,
    pub workflow_id: Uuid,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub execution_id: Option<Uuid>,
    pub error_message: Option<String>,
}

fn row_to_delivery(row: &sqlx::postgres::PgRow) -> Result<DeliveryRow> {
    let status: String = row.try_get("status")?;
    Ok(DeliveryRow {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: DeliveryStatus::parse(&status)
            .with_context(|| format!("invalid delivery status in DB: {status}"))?,
        attempt_count: row.try_get("attempt_count")?,
        execution_id: row.try_get("execution_id")?,
        error_message: row.try_get("error_message")?,
    })
}

const DELIVERY_COLUMNS: &str =
    "id, event_id, workflow_id, status, attempt_count, execution_id, error_message";

pub async fn list_deliveries_for_event(pool: &PgPool, event_id: Uuid) -> Result<Vec<DeliveryRow>> {
    let rows = sqlx::query(&format!(
        "select {DELIVERY_COLUMNS} from event_deliveries where event_id = $1 order by created_at"
    ))
    .bind(event_id)
    .fetch_all(pool)
    .await
    .context("list_deliveries_for_event failed")?;
    rows.iter().map(row_to_delivery).collect()
}

/// The delivery backed by a given execution, if any. Absence simply means
/// the execution was not event-triggered.
pub async fn fetch_delivery_by_execution(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Option<DeliveryRow>> {
    let row = sqlx::query(&format!(
        "select {DELIVERY_COLUMNS} from event_deliveries where execution_id = $1"
    ))
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .context("fetch_delivery_by_execution failed")?;
    row.as_ref().map(row_to_delivery).transpose()
}

/// Transition a delivery to `Queued` and bind the execution that backs it.
pub async fn mark_delivery_queued(
    pool: &PgPool,
    delivery_id: Uuid,
    execution_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "update event_deliveries set status = $2, execution_id = $3 where id = $1",
    )
    .bind(delivery_id)
    .bind(DeliveryStatus::Queued.as_str())
    .bind(execution_id)
    .execute(pool)
    .await
    .context("mark_delivery_queued failed")?;
    Ok(())
}

/// Terminal delivery write: status, completion stamp, attempt bump, error.
pub async fn complete_delivery(
    pool: &PgPool,
    delivery_id: Uuid,
    status: DeliveryStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update event_deliveries
        set status = $2,
            completed_at = (now() at time zone 'utc'),
            attempt_count = attempt_count + 1,
            error_message = coalesce($3, error_message)
        where id = $1
        "#,
    )
    .bind(delivery_id)
    .bind(status.as_str())
    .bind(error_message)
    .execute(pool)
    .await
    .context("complete_delivery failed")?;
    Ok(())
}

/// Record a queueing failure for a delivery that never reached the broker.
pub async fn mark_delivery_failed(
    pool: &PgPool,
    delivery_id: Uuid,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        "update event_deliveries set status = $2, error_message = $3 where id = $1",
    )
    .bind(delivery_id)
    .bind(DeliveryStatus::Failed.as_str())
    .bind(error_message)
    .execute(pool)
    .await
    .context("mark_delivery_failed failed")?;
    Ok(())
}

/// Re-aggregate an event's status from its deliveries:
/// any pending/queued → `Processing`; all success → `Completed`; mixed →
/// `PartiallyFailed`; all failed → `Failed`. Returns the new status.
pub async fn update_event_status(pool: &PgPool, event_id: Uuid) -> Result<EventStatus> {
    let deliveries = list_deliveries_for_event(pool, event_id).await?;

    let open = deliveries
        .iter()
        .any(|d| matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::Queued));
    let succeeded = deliveries
        .iter()
        .filter(|d| d.status == DeliveryStatus::Success)
        .count();
    let failed = deliveries
        .iter()
        .filter(|d| d.status == DeliveryStatus::Failed)
        .count();

    let status = if deliveries.is_empty() || (!open && failed == 0) {
        EventStatus::Completed
    } else if open {
        EventStatus::Processing
    } else if succeeded > 0 {
        EventStatus::PartiallyFailed
    } else {
        EventStatus::Failed
    };

    sqlx::query("update events set status = $2 where id = $1")
        .bind(event_id)
        .bind(status.as_str())
        .execute(pool)
        .await
        .context("update_event_status failed")?;

    Ok(status)
}

// ---------------------------------------------------------------------------
// Cleanup sweeps
// ---------------------------------------------------------------------------

/// Deliveries stuck in `Pending`/`Queued` beyond the cutoff become `Failed`;
/// returns the affected event ids so the sweeper can re-aggregate them.
pub async fn fail_stuck_deliveries(pool: &PgPool, older_than_seconds: i64) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        update event_deliveries
        set status = 'Failed',
            error_message = 'Delivery did not complete in time',
            completed_at = (now() at time zone 'utc')
        where status in ('Pending', 'Queued')
          and created_at < (now() at time zone 'utc') - make_interval(secs => $1)
        returning event_id
        "#,
    )
    .bind(older_than_seconds as f64)
    .fetch_all(pool)
    .await
    .context("fail_stuck_deliveries failed")?;

    let mut event_ids: Vec<Uuid> = rows
        .iter()
        .map(|r| r.try_get::<Uuid, _>("event_id"))
        .collect::<Result<_, _>>()?;
    event_ids.sort();
    event_ids.dedup();
    Ok(event_ids)
}

/// Retention sweep: delete events (and their deliveries, via cascade) older
/// than the retention window. Returns the number of events removed.
pub async fn delete_old_events(pool: &PgPool, retention_days: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from events
        where received_at < (now() at time zone 'utc') - make_interval(days => $1)
        "#,
    )
    .bind(retention_days as i32)
    .execute(pool)
    .await
    .context("delete_old_events failed")?;
    Ok(res.rows_affected())
}
