//! Execution → delivery back-propagation.
//!
//! The worker calls this after every terminal write. The back-edge is
//! resolved by query (delivery rows store the execution id), never by an
//! in-memory reference, which keeps the Event→Delivery→Execution cycle
//! broken at the type level.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use bfr_cache::CacheClient;
use bfr_db::events as db_events;
use bfr_schemas::{DeliveryStatus, ExecutionStatus};

use crate::processor::{broadcast_event, delivery_counts, EventBroadcast};

/// Update the delivery backed by `execution_id`, re-aggregate its event's
/// status, and broadcast the new counts. A no-op when the execution was not
/// event-triggered.
pub async fn update_delivery_from_execution(
    pool: &PgPool,
    cache: &CacheClient,
    execution_id: Uuid,
    status: ExecutionStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let Some(delivery) = db_events::fetch_delivery_by_execution(pool, execution_id).await? else {
        debug!(%execution_id, "no event delivery to update");
        return Ok(());
    };

    let delivery_status = DeliveryStatus::from_execution(status);
    db_events::complete_delivery(pool, delivery.id, delivery_status, error_message).await?;
    db_events::update_event_status(pool, delivery.event_id).await?;

    info!(
        delivery_id = %delivery.id,
        %execution_id,
        status = %delivery_status,
        "updated event delivery status"
    );

    if let Some(event) = db_events::fetch_event(pool, delivery.event_id).await? {
        let counts =
            delivery_counts(&db_events::list_deliveries_for_event(pool, delivery.event_id).await?);
        broadcast_event(cache, &event, EventBroadcast::Updated, counts).await;
    }
    Ok(())
}
