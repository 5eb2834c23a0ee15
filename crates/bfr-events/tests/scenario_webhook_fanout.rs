//! End-to-end webhook fan-out against a live Postgres + Redis.
//!
//! Requires DATABASE_URL and a reachable Redis; the suite skips itself
//! when either is absent. Covers: adapter accept → event row + N pending
//! deliveries in one transaction → deferred queueing → execution
//! back-propagation → event status aggregation.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use bfr_events::{
    queue_event_deliveries, update_delivery_from_execution, AdapterRegistry, EventProcessor,
    HandleResult, WebhookRequest,
};
use bfr_schemas::{DeliveryStatus, EventStatus, ExecutionStatus};
use bfr_testkit::RecordingEnqueuer;

struct Harness {
    pool: sqlx::PgPool,
    cache: bfr_cache::CacheClient,
}

async fn harness() -> Option<Harness> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skipping: DATABASE_URL not set");
        return None;
    }
    let pool = bfr_db::test_pool_from_env().await.ok()?;
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let cache = match bfr_cache::CacheClient::connect(&redis_url).await {
        Ok(cache) => cache,
        Err(_) => {
            eprintln!("skipping: no Redis at {redis_url}");
            return None;
        }
    };
    Some(Harness { pool, cache })
}

/// Seed one active source + webhook (generic adapter) + N subscriptions,
/// each bound to a fresh workflow. Returns the event-source id and the
/// workflow ids.
async fn seed_source(pool: &sqlx::PgPool, subscriptions: usize) -> (Uuid, Vec<Uuid>) {
    let source_id = Uuid::new_v4();
    sqlx::query("insert into event_sources (id, name, is_active) values ($1, 'orders', true)")
        .bind(source_id)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        insert into webhook_sources (id, event_source_id, adapter_name, config)
        values ($1, $2, 'generic', '{"event_type_field": "event"}')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(source_id)
    .execute(pool)
    .await
    .unwrap();

    let mut workflow_ids = Vec::new();
    for i in 0..subscriptions {
        let workflow_id = Uuid::new_v4();
        sqlx::query(
            "insert into workflows (id, name, execution_mode) values ($1, $2, 'async')",
        )
        .bind(workflow_id)
        .bind(format!("on_order_{i}"))
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            insert into event_subscriptions (id, event_source_id, event_type, workflow_id, is_active)
            values ($1, $2, 'order.created', $3, true)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(source_id)
        .bind(workflow_id)
        .execute(pool)
        .await
        .unwrap();
        workflow_ids.push(workflow_id);
    }
    (source_id, workflow_ids)
}

fn order_created_request() -> WebhookRequest {
    WebhookRequest {
        method: "POST".to_string(),
        path: "/api/hooks/test".to_string(),
        headers: Default::default(),
        query: Default::default(),
        body: serde_json::to_vec(&json!({"event": "order.created", "order_id": 42})).unwrap(),
        client_ip: Some("203.0.113.9".to_string()),
    }
}

#[tokio::test]
async fn fanout_creates_queues_and_completes_deliveries() {
    let Some(h) = harness().await else { return };
    let (source_id, _workflows) = seed_source(&h.pool, 2).await;

    let processor = EventProcessor::new(
        h.pool.clone(),
        h.cache.clone(),
        Arc::new(AdapterRegistry::with_builtins()),
    );

    // Intake: one event, two pending deliveries, committed.
    let outcome = processor
        .process_webhook(&source_id.to_string(), &order_created_request())
        .await;
    assert!(matches!(outcome.result, HandleResult::Deliver { .. }));
    let event_id = outcome.event_id.expect("deliver carries the event id");

    let event = bfr_db::events::fetch_event(&h.pool, event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::Processing);

    let deliveries = bfr_db::events::list_deliveries_for_event(&h.pool, event_id)
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Pending));

    // Deferred enqueue: both become Queued with execution ids.
    let enqueuer = RecordingEnqueuer::default();
    let queued = queue_event_deliveries(&h.pool, &h.cache, &enqueuer, event_id)
        .await
        .unwrap();
    assert_eq!(queued, 2);

    let deliveries = bfr_db::events::list_deliveries_for_event(&h.pool, event_id)
        .await
        .unwrap();
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Queued));
    assert!(deliveries.iter().all(|d| d.execution_id.is_some()));

    // Both backing executions succeed → deliveries Success, event Completed.
    for delivery in &deliveries {
        update_delivery_from_execution(
            &h.pool,
            &h.cache,
            delivery.execution_id.unwrap(),
            ExecutionStatus::Success,
            None,
        )
        .await
        .unwrap();
    }

    let deliveries = bfr_db::events::list_deliveries_for_event(&h.pool, event_id)
        .await
        .unwrap();
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Success));
    assert!(deliveries.iter().all(|d| d.attempt_count == 1));

    let event = bfr_db::events::fetch_event(&h.pool, event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::Completed);
}

#[tokio::test]
async fn mixed_outcomes_aggregate_to_partially_failed() {
    let Some(h) = harness().await else { return };
    let (source_id, _workflows) = seed_source(&h.pool, 2).await;

    let processor = EventProcessor::new(
        h.pool.clone(),
        h.cache.clone(),
        Arc::new(AdapterRegistry::with_builtins()),
    );
    let outcome = processor
        .process_webhook(&source_id.to_string(), &order_created_request())
        .await;
    let event_id = outcome.event_id.unwrap();

    let enqueuer = RecordingEnqueuer::default();
    queue_event_deliveries(&h.pool, &h.cache, &enqueuer, event_id)
        .await
        .unwrap();

    let deliveries = bfr_db::events::list_deliveries_for_event(&h.pool, event_id)
        .await
        .unwrap();
    update_delivery_from_execution(
        &h.pool,
        &h.cache,
        deliveries[0].execution_id.unwrap(),
        ExecutionStatus::Success,
        None,
    )
    .await
    .unwrap();
    update_delivery_from_execution(
        &h.pool,
        &h.cache,
        deliveries[1].execution_id.unwrap(),
        ExecutionStatus::Timeout,
        Some("timed out"),
    )
    .await
    .unwrap();

    let event = bfr_db::events::fetch_event(&h.pool, event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::PartiallyFailed);
}

#[tokio::test]
async fn no_subscriptions_completes_the_event_immediately() {
    let Some(h) = harness().await else { return };
    let (source_id, _workflows) = seed_source(&h.pool, 0).await;

    let processor = EventProcessor::new(
        h.pool.clone(),
        h.cache.clone(),
        Arc::new(AdapterRegistry::with_builtins()),
    );
    let outcome = processor
        .process_webhook(&source_id.to_string(), &order_created_request())
        .await;
    let event_id = outcome.event_id.unwrap();

    let event = bfr_db::events::fetch_event(&h.pool, event_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert!(bfr_db::events::list_deliveries_for_event(&h.pool, event_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unknown_source_is_rejected_404() {
    let Some(h) = harness().await else { return };
    let processor = EventProcessor::new(
        h.pool.clone(),
        h.cache.clone(),
        Arc::new(AdapterRegistry::with_builtins()),
    );

    let outcome = processor
        .process_webhook(&Uuid::new_v4().to_string(), &order_created_request())
        .await;
    match outcome.result {
        HandleResult::Rejected { status, .. } => assert_eq!(status, 404),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert!(outcome.event_id.is_none());
}

#[tokio::test]
async fn enqueue_failure_marks_delivery_failed() {
    let Some(h) = harness().await else { return };
    let (source_id, workflows) = seed_source(&h.pool, 1).await;

    let processor = EventProcessor::new(
        h.pool.clone(),
        h.cache.clone(),
        Arc::new(AdapterRegistry::with_builtins()),
    );
    let outcome = processor
        .process_webhook(&source_id.to_string(), &order_created_request())
        .await;
    let event_id = outcome.event_id.unwrap();

    let enqueuer = RecordingEnqueuer::default();
    enqueuer.fail_for.lock().unwrap().push(workflows[0]);
    let queued = queue_event_deliveries(&h.pool, &h.cache, &enqueuer, event_id)
        .await
        .unwrap();
    assert_eq!(queued, 0);

    let deliveries = bfr_db::events::list_deliveries_for_event(&h.pool, event_id)
        .await
        .unwrap();
    assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
    assert!(deliveries[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("broker unavailable"));
}
