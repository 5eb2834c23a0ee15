//! Broker topology declaration.
//!
//! Per logical queue Q:
//!   - direct durable exchange `Q-dlx`
//!   - durable queue `Q-poison` bound to `Q-dlx` with routing key `Q`
//!   - durable queue `Q` with `x-dead-letter-exchange=Q-dlx`,
//!     `x-dead-letter-routing-key=Q`, priority support 0–9
//!
//! A handler exception NACKs without requeue, which routes the message to
//! the poison queue for human inspection. The poison queue is never
//! auto-drained.

use anyhow::{Context, Result};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, ShortString},
    Channel, ExchangeKind,
};

pub fn dead_letter_exchange(queue: &str) -> String {
    format!("{queue}-dlx")
}

pub fn poison_queue(queue: &str) -> String {
    format!("{queue}-poison")
}

/// Declare the full work-queue topology. Idempotent; called by both
/// publisher and consumer.
pub async fn declare_work_queue(channel: &Channel, queue: &str) -> Result<()> {
    let dlx = dead_letter_exchange(queue);
    let poison = poison_queue(queue);

    channel
        .exchange_declare(
            &dlx,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("declare exchange {dlx} failed"))?;

    channel
        .queue_declare(
            &poison,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("declare queue {poison} failed"))?;

    channel
        .queue_bind(
            &poison,
            &dlx,
            queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("bind {poison} to {dlx} failed"))?;

    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(dlx.clone().into()),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(queue.to_string().into()),
    );
    args.insert(ShortString::from("x-max-priority"), AMQPValue::ShortShortUInt(9));

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .with_context(|| format!("declare queue {queue} failed"))?;

    Ok(())
}

/// Declare a durable fanout exchange (broadcast pattern).
pub async fn declare_broadcast_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("declare fanout {exchange} failed"))?;
    Ok(())
}

/// Declare a transient auto-delete fanout exchange (streaming pattern).
pub async fn declare_stream_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("declare stream fanout {exchange} failed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_names() {
        assert_eq!(dead_letter_exchange("workflow-executions"), "workflow-executions-dlx");
        assert_eq!(poison_queue("workflow-executions"), "workflow-executions-poison");
    }
}
