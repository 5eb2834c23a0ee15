//! Consumption patterns.
//!
//! A consumer owns one dedicated connection, sets prefetch, declares its
//! topology, and spawns one task per delivery — concurrency is bounded by
//! the channel prefetch, not by task count. A handler error NACKs without
//! requeue, deferring to the dead-letter topology.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::pool::AmqpPools;
use crate::topology;

/// A competing consumer over one work queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync + 'static {
    fn queue_name(&self) -> &str;

    /// AMQP prefetch — also the per-instance concurrency bound.
    fn prefetch(&self) -> u16 {
        1
    }

    /// Process one parsed message. An `Err` routes the delivery to the
    /// poison queue.
    async fn handle(&self, body: Value) -> Result<()>;
}

/// Run a consumer until its connection dies. The caller owns restart policy.
pub async fn run_consumer(pools: &AmqpPools, consumer: Arc<dyn QueueConsumer>) -> Result<()> {
    let connection = pools.dedicated_connection().await?;
    let channel = connection
        .create_channel()
        .await
        .context("consumer channel failed")?;
    channel
        .basic_qos(consumer.prefetch(), BasicQosOptions::default())
        .await
        .context("basic_qos failed")?;

    let queue = consumer.queue_name().to_string();
    topology::declare_work_queue(&channel, &queue).await?;

    let mut deliveries = channel
        .basic_consume(
            &queue,
            &format!("{queue}-consumer"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("basic_consume on {queue} failed"))?;

    info!(queue = %queue, prefetch = consumer.prefetch(), "consumer started");

    while let Some(delivery) = deliveries.next().await {
        let delivery = delivery.context("delivery stream error")?;
        let consumer = Arc::clone(&consumer);
        let queue = queue.clone();
        tokio::spawn(async move {
            let body: Value = match serde_json::from_slice(&delivery.data) {
                Ok(v) => v,
                Err(err) => {
                    // Unparseable message: straight to the poison queue.
                    error!(queue = %queue, error = %err, "undecodable message");
                    let _ = delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await;
                    return;
                }
            };

            match consumer.handle(body).await {
                Ok(()) => {
                    if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(queue = %queue, error = %err, "ack failed");
                    }
                }
                Err(err) => {
                    error!(queue = %queue, error = ?err, "message handler failed; dead-lettering");
                    let _ = delivery
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await;
                }
            }
        });
    }

    warn!(queue = %consumer.queue_name(), "consumer stream ended");
    drop(connection);
    Ok(())
}

/// A broadcast subscriber: every live instance receives every message via
/// its own exclusive auto-delete queue bound to a durable fanout exchange.
#[async_trait]
pub trait BroadcastConsumer: Send + Sync + 'static {
    fn exchange_name(&self) -> &str;

    async fn handle(&self, body: Value) -> Result<()>;
}

pub async fn run_broadcast_consumer(
    pools: &AmqpPools,
    consumer: Arc<dyn BroadcastConsumer>,
) -> Result<()> {
    let connection = pools.dedicated_connection().await?;
    let channel = connection
        .create_channel()
        .await
        .context("broadcast channel failed")?;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .context("basic_qos failed")?;

    let exchange = consumer.exchange_name().to_string();
    topology::declare_broadcast_exchange(&channel, &exchange).await?;

    // Empty name: the broker generates a unique, instance-scoped queue.
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("broadcast queue declare failed")?;
    channel
        .queue_bind(
            queue.name().as_str(),
            &exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("broadcast queue bind failed")?;

    let mut deliveries = channel
        .basic_consume(
            queue.name().as_str(),
            &format!("{exchange}-broadcast"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("broadcast basic_consume failed")?;

    info!(exchange = %exchange, queue = %queue.name(), "broadcast consumer started");

    while let Some(delivery) = deliveries.next().await {
        let delivery = delivery.context("broadcast delivery stream error")?;
        let consumer = Arc::clone(&consumer);
        let exchange = exchange.clone();
        tokio::spawn(async move {
            let body: Value = match serde_json::from_slice(&delivery.data) {
                Ok(v) => v,
                Err(err) => {
                    warn!(exchange = %exchange, error = %err, "undecodable broadcast");
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                    return;
                }
            };
            // No DLQ for broadcasts (each instance has a private queue):
            // log the failure and ack so the queue keeps draining.
            if let Err(err) = consumer.handle(body).await {
                error!(exchange = %exchange, error = ?err, "broadcast handler failed");
            }
            let _ = delivery.ack(BasicAckOptions::default()).await;
        });
    }

    warn!(exchange = %consumer.exchange_name(), "broadcast stream ended");
    drop(connection);
    Ok(())
}
