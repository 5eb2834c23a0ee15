//! Publish helpers.
//!
//! Every helper declares its topology before publishing so enqueue and
//! consume can never diverge. Work-queue messages are persistent
//! (delivery-mode 2) with optional priority 0–9; stream messages are
//! transient for latency.

use anyhow::{Context, Result};
use lapin::{options::BasicPublishOptions, BasicProperties};
use serde::Serialize;
use tracing::debug;

use crate::pool::AmqpPools;
use crate::topology;

/// Publish a persistent message to a work queue (default exchange routing).
pub async fn publish_message<T: Serialize>(
    pools: &AmqpPools,
    queue: &str,
    message: &T,
    priority: u8,
) -> Result<()> {
    let body = serde_json::to_vec(message).context("serialize queue message")?;
    let channel = pools.channel().await?;
    topology::declare_work_queue(channel.get(), queue).await?;

    channel
        .get()
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_priority(priority.min(9)),
        )
        .await
        .with_context(|| format!("publish to {queue} failed"))?
        .await
        .with_context(|| format!("publish confirm for {queue} failed"))?;

    debug!(queue, "published message");
    Ok(())
}

/// Publish to a durable fanout exchange — every live subscriber instance
/// receives a copy (cache invalidations, package installs).
pub async fn publish_broadcast<T: Serialize>(
    pools: &AmqpPools,
    exchange: &str,
    message: &T,
) -> Result<()> {
    let body = serde_json::to_vec(message).context("serialize broadcast message")?;
    let channel = pools.channel().await?;
    topology::declare_broadcast_exchange(channel.get(), exchange).await?;

    channel
        .get()
        .basic_publish(
            exchange,
            "",
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await
        .with_context(|| format!("broadcast to {exchange} failed"))?
        .await
        .with_context(|| format!("broadcast confirm for {exchange} failed"))?;

    debug!(exchange, "published broadcast");
    Ok(())
}

/// Publish a transient message to a streaming exchange. Subscribers stop on
/// a `{"type": "done"}` or `{"type": "error"}` sentinel.
pub async fn publish_stream_message<T: Serialize>(
    pools: &AmqpPools,
    exchange: &str,
    message: &T,
) -> Result<()> {
    let body = serde_json::to_vec(message).context("serialize stream message")?;
    let channel = pools.channel().await?;
    topology::declare_stream_exchange(channel.get(), exchange).await?;

    channel
        .get()
        .basic_publish(
            exchange,
            "",
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default().with_delivery_mode(1),
        )
        .await
        .with_context(|| format!("stream publish to {exchange} failed"))?
        .await
        .with_context(|| format!("stream confirm for {exchange} failed"))?;
    Ok(())
}
