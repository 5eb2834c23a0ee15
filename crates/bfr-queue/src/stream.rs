//! Streaming consumption.
//!
//! A transient fanout exchange carries non-persistent messages to an
//! exclusive, auto-delete queue; the subscriber iterates until a sentinel
//! `{"type": "done"}` / `{"type": "error"}` message or the idle timeout.
//! Used for long operations that stream partial output back to one waiter.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pool::AmqpPools;
use crate::topology;

/// Whether a message terminates the stream.
pub fn is_sentinel(body: &Value) -> bool {
    matches!(
        body.get("type").and_then(Value::as_str),
        Some("done") | Some("error")
    )
}

/// Subscribe to a streaming exchange. Messages (including the terminal
/// sentinel) arrive on the returned receiver; the channel closes after the
/// sentinel, on `timeout` of inactivity, or when the receiver is dropped.
pub async fn stream_from_exchange(
    pools: &AmqpPools,
    exchange: &str,
    timeout: Option<Duration>,
) -> Result<mpsc::Receiver<Value>> {
    let connection = pools.dedicated_connection().await?;
    let channel = connection
        .create_channel()
        .await
        .context("stream channel failed")?;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .context("basic_qos failed")?;

    topology::declare_stream_exchange(&channel, exchange).await?;

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
        .context("stream queue declare failed")?;
    channel
        .queue_bind(
            queue.name().as_str(),
            exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("stream queue bind failed")?;

    let mut deliveries = channel
        .basic_consume(
            queue.name().as_str(),
            &format!("{exchange}-stream"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("stream basic_consume failed")?;

    let (tx, rx) = mpsc::channel(32);
    let exchange = exchange.to_string();

    tokio::spawn(async move {
        // Move the connection and channel in so they outlive the stream.
        let _connection = connection;
        let _channel = channel;
        loop {
            let next = match timeout {
                Some(t) => match tokio::time::timeout(t, deliveries.next()).await {
                    Ok(n) => n,
                    Err(_) => {
                        debug!(exchange = %exchange, "stream idle timeout");
                        break;
                    }
                },
                None => deliveries.next().await,
            };

            let Some(delivery) = next else { break };
            let delivery = match delivery {
                Ok(d) => d,
                Err(err) => {
                    warn!(exchange = %exchange, error = %err, "stream delivery error");
                    break;
                }
            };
            let _ = delivery.ack(BasicAckOptions::default()).await;

            let body: Value = match serde_json::from_slice(&delivery.data) {
                Ok(v) => v,
                Err(err) => {
                    warn!(exchange = %exchange, error = %err, "undecodable stream message");
                    continue;
                }
            };

            let terminal = is_sentinel(&body);
            if tx.send(body).await.is_err() {
                break; // waiter gone
            }
            if terminal {
                debug!(exchange = %exchange, "stream sentinel received");
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sentinel_detection() {
        assert!(is_sentinel(&json!({"type": "done"})));
        assert!(is_sentinel(&json!({"type": "error", "message": "boom"})));
        assert!(!is_sentinel(&json!({"type": "chunk", "data": "..."})));
        assert!(!is_sentinel(&json!({"data": "no type"})));
    }
}
