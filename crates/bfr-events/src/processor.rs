//! Webhook processing pipeline.
//!
//! `process_webhook` never returns `Err` to the HTTP layer: every internal
//! failure maps to a `Rejected` result with a status code. The deferred
//! `queue_event_deliveries` pass runs strictly after the event transaction
//! commits.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bfr_cache::CacheClient;
use bfr_db::events as db_events;
use bfr_db::events::{DeliveryRow, EventRow, NewEvent};
use bfr_schemas::{channels, BusMessage, DeliveryStatus, EventCounts, EventSummary};

use crate::protocol::{HandleResult, WebhookRequest};
use crate::registry::AdapterRegistry;

// ---------------------------------------------------------------------------
// Enqueue seam
// ---------------------------------------------------------------------------

/// The system-execution helper the processor uses to turn a delivery into a
/// queued run. The production implementation lives with the intake layer;
/// tests substitute a recorder.
#[async_trait]
pub trait DeliveryEnqueuer: Send + Sync {
    /// Enqueue one workflow execution; returns the assigned execution id.
    async fn enqueue_system_execution(
        &self,
        workflow_id: Uuid,
        parameters: Value,
        org_id_hint: Option<Uuid>,
    ) -> Result<Uuid>;
}

// ---------------------------------------------------------------------------
// EventProcessor
// ---------------------------------------------------------------------------

pub struct EventProcessor {
    pool: PgPool,
    cache: CacheClient,
    registry: Arc<AdapterRegistry>,
}

/// What the HTTP layer gets back: the response to send, plus the persisted
/// event's id when the request was a `Deliver` (input to the deferred
/// `queue_event_deliveries` pass).
#[derive(Debug)]
pub struct WebhookOutcome {
    pub result: HandleResult,
    pub event_id: Option<Uuid>,
}

impl WebhookOutcome {
    fn respond(result: HandleResult) -> Self {
        Self {
            result,
            event_id: None,
        }
    }
}

impl EventProcessor {
    pub fn new(pool: PgPool, cache: CacheClient, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            pool,
            cache,
            registry,
        }
    }

    /// Full intake pipeline for one webhook request. On `Deliver`, the
    /// event row and its `Pending` deliveries are committed before this
    /// returns; the caller then runs `queue_event_deliveries`.
    pub async fn process_webhook(
        &self,
        source_id: &str,
        request: &WebhookRequest,
    ) -> WebhookOutcome {
        let Ok(source_uuid) = source_id.parse::<Uuid>() else {
            warn!(source_id, "malformed webhook source id");
            return WebhookOutcome::respond(HandleResult::rejected("Invalid webhook URL", 404));
        };

        let webhook = match db_events::fetch_webhook_source(&self.pool, source_uuid).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                warn!(%source_uuid, "webhook not found");
                return WebhookOutcome::respond(HandleResult::rejected("Webhook not found", 404));
            }
            Err(err) => {
                error!(error = ?err, "webhook source lookup failed");
                return WebhookOutcome::respond(HandleResult::rejected(
                    "Error processing webhook",
                    500,
                ));
            }
        };

        if !webhook.source_is_active {
            warn!(%source_uuid, "event source inactive");
            return WebhookOutcome::respond(HandleResult::rejected("Webhook is inactive", 404));
        }

        let Some(adapter) = self.registry.get(&webhook.adapter_name) else {
            error!(adapter = %webhook.adapter_name, "webhook adapter not registered");
            return WebhookOutcome::respond(HandleResult::rejected(
                "Webhook adapter not configured",
                500,
            ));
        };

        let mut state = webhook.state.clone();
        let result = match adapter
            .handle_request(request, &webhook.config, &mut state)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                error!(error = ?err, adapter = %webhook.adapter_name, "adapter error");
                return WebhookOutcome::respond(HandleResult::rejected(
                    "Error processing webhook",
                    500,
                ));
            }
        };

        // Persist adapter state mutations regardless of the result kind
        // (handshake markers matter even for Validation responses).
        if state != webhook.state {
            if let Err(err) = db_events::store_webhook_state(&self.pool, webhook.id, &state).await
            {
                warn!(error = ?err, "failed to persist adapter state");
            }
        }

        match result {
            HandleResult::Validation { .. } => {
                debug!(%source_uuid, "webhook validation response");
                WebhookOutcome::respond(result)
            }
            HandleResult::Rejected { ref message, .. } => {
                warn!(%source_uuid, message, "webhook rejected by adapter");
                WebhookOutcome::respond(result)
            }
            HandleResult::Deliver {
                ref event_type,
                ref data,
                ref raw_headers,
            } => {
                match self
                    .persist_event(&webhook, event_type, data, raw_headers, request)
                    .await
                {
                    Ok(event_id) => WebhookOutcome {
                        result,
                        event_id: Some(event_id),
                    },
                    Err(err) => {
                        error!(error = ?err, "failed to persist event");
                        WebhookOutcome::respond(HandleResult::rejected(
                            "Error processing webhook",
                            500,
                        ))
                    }
                }
            }
        }
    }

    async fn persist_event(
        &self,
        webhook: &db_events::WebhookSourceRow,
        event_type: &str,
        data: &Value,
        raw_headers: &Value,
        request: &WebhookRequest,
    ) -> Result<Uuid> {
        let subscriptions = db_events::list_matching_subscriptions(
            &self.pool,
            webhook.event_source_id,
            event_type,
        )
        .await?;

        let new = NewEvent {
            id: Uuid::new_v4(),
            event_source_id: webhook.event_source_id,
            event_type: event_type.to_string(),
            headers: raw_headers.clone(),
            data: data.clone(),
            source_ip: request.client_ip.clone(),
        };
        let event = db_events::create_event_with_deliveries(&self.pool, &new, &subscriptions).await?;

        info!(
            event_id = %event.id,
            event_source_id = %event.event_source_id,
            event_type,
            subscriptions = subscriptions.len(),
            "event received"
        );

        broadcast_event(&self.cache, &event, EventBroadcast::Created, EventCounts::default()).await;
        Ok(event.id)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn cache(&self) -> &CacheClient {
        &self.cache
    }
}

// ---------------------------------------------------------------------------
// Deferred enqueue
// ---------------------------------------------------------------------------

/// Queue one workflow execution per `Pending` delivery of the event. Runs
/// after the intake transaction commits. Each delivery becomes `Queued`
/// with its execution id, or `Failed` with the enqueue error. Ends with a
/// `deliveries_queued` broadcast carrying the current counts.
pub async fn queue_event_deliveries(
    pool: &PgPool,
    cache: &CacheClient,
    enqueuer: &dyn DeliveryEnqueuer,
    event_id: Uuid,
) -> Result<usize> {
    let Some(event) = db_events::fetch_event(pool, event_id).await? else {
        anyhow::bail!("event {event_id} not found when queueing deliveries");
    };

    let deliveries = db_events::list_deliveries_for_event(pool, event_id).await?;
    let mut queued = 0usize;

    for delivery in &deliveries {
        if delivery.status != DeliveryStatus::Pending {
            continue;
        }

        let parameters = delivery_parameters(&event, delivery);
        match enqueuer
            .enqueue_system_execution(delivery.workflow_id, parameters, None)
            .await
        {
            Ok(execution_id) => {
                db_events::mark_delivery_queued(pool, delivery.id, execution_id).await?;
                queued += 1;
                info!(
                    execution_id = %execution_id,
                    delivery_id = %delivery.id,
                    workflow_id = %delivery.workflow_id,
                    event_id = %event.id,
                    "queued workflow execution for event delivery"
                );
            }
            Err(err) => {
                error!(delivery_id = %delivery.id, error = ?err, "failed to queue delivery");
                db_events::mark_delivery_failed(pool, delivery.id, &err.to_string()).await?;
            }
        }
    }

    let counts = delivery_counts(&db_events::list_deliveries_for_event(pool, event_id).await?);
    broadcast_event(cache, &event, EventBroadcast::DeliveriesQueued, counts).await;
    Ok(queued)
}

/// Workflow parameters for a delivery: the event body's top-level fields
/// flattened (so they match function signatures), plus the complete event
/// context under the reserved `_event` key.
pub fn delivery_parameters(event: &EventRow, _delivery: &DeliveryRow) -> Value {
    let mut parameters = match &event.data {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };

    parameters["_event"] = json!({
        "id": event.id,
        "type": event.event_type,
        "body": event.data,
        "headers": event.headers,
        "received_at": event.received_at.and_utc().to_rfc3339(),
        "source_ip": event.source_ip,
    });
    parameters
}

// ---------------------------------------------------------------------------
// Broadcast helpers
// ---------------------------------------------------------------------------

pub(crate) enum EventBroadcast {
    Created,
    Updated,
    DeliveriesQueued,
}

pub(crate) fn delivery_counts(deliveries: &[DeliveryRow]) -> EventCounts {
    let mut counts = EventCounts {
        delivery_count: deliveries.len() as i64,
        ..Default::default()
    };
    for d in deliveries {
        match d.status {
            DeliveryStatus::Success => counts.success_count += 1,
            DeliveryStatus::Failed => counts.failed_count += 1,
            DeliveryStatus::Queued => counts.queued_count += 1,
            DeliveryStatus::Pending => counts.pending_count += 1,
        }
    }
    counts
}

/// Fire-and-forget event broadcast; failures log at warn and never bubble.
pub(crate) async fn broadcast_event(
    cache: &CacheClient,
    event: &EventRow,
    kind: EventBroadcast,
    counts: EventCounts,
) {
    let summary = EventSummary {
        id: event.id,
        event_source_id: event.event_source_id,
        event_type: event.event_type.clone(),
        status: event.status.as_str().to_string(),
        received_at: Some(event.received_at.and_utc()),
        source_ip: event.source_ip.clone(),
        counts,
    };
    let message = match kind {
        EventBroadcast::Created => BusMessage::EventCreated { event: summary },
        EventBroadcast::Updated => BusMessage::EventUpdated { event: summary },
        EventBroadcast::DeliveriesQueued => BusMessage::DeliveriesQueued { event: summary },
    };
    let channel = channels::event_source(event.event_source_id);
    if let Err(err) = cache.publish(&channel, &message).await {
        warn!(error = ?err, %channel, "failed to broadcast event update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfr_schemas::EventStatus;
    use chrono::Utc;

    fn delivery(status: DeliveryStatus) -> DeliveryRow {
        DeliveryRow {
            id: Uuid::new_v4(),
            event_id: Uuid::nil(),
            workflow_id: Uuid::new_v4(),
            status,
            attempt_count: 0,
            execution_id: None,
            error_message: None,
        }
    }

    #[test]
    fn counts_partition_by_status() {
        let deliveries = vec![
            delivery(DeliveryStatus::Success),
            delivery(DeliveryStatus::Success),
            delivery(DeliveryStatus::Failed),
            delivery(DeliveryStatus::Queued),
            delivery(DeliveryStatus::Pending),
        ];
        let counts = delivery_counts(&deliveries);
        assert_eq!(counts.success_count, 2);
        assert_eq!(counts.failed_count, 1);
        assert_eq!(counts.queued_count, 1);
        assert_eq!(counts.pending_count, 1);
        assert_eq!(counts.delivery_count, 5);
    }

    #[test]
    fn delivery_parameters_flatten_body_and_carry_event_context() {
        let event = EventRow {
            id: Uuid::new_v4(),
            event_source_id: Uuid::new_v4(),
            event_type: "order.created".to_string(),
            received_at: Utc::now().naive_utc(),
            headers: Some(json!({"x-event-type": "order.created"})),
            data: Some(json!({"order_id": 42, "total": "9.99"})),
            source_ip: Some("203.0.113.9".to_string()),
            status: EventStatus::Processing,
        };
        let d = delivery(DeliveryStatus::Pending);
        let params = delivery_parameters(&event, &d);
        assert_eq!(params["order_id"], 42);
        assert_eq!(params["total"], "9.99");
        assert_eq!(params["_event"]["type"], "order.created");
        assert_eq!(params["_event"]["body"]["order_id"], 42);
    }

    #[test]
    fn non_object_bodies_still_carry_event_context() {
        let event = EventRow {
            id: Uuid::new_v4(),
            event_source_id: Uuid::new_v4(),
            event_type: "raw.payload".to_string(),
            received_at: Utc::now().naive_utc(),
            headers: None,
            data: Some(json!("plain text body")),
            source_ip: None,
            status: EventStatus::Received,
        };
        let d = delivery(DeliveryStatus::Pending);
        let params = delivery_parameters(&event, &d);
        assert_eq!(params["_event"]["body"], "plain text body");
        assert!(params.as_object().unwrap().len() == 1);
    }
}
