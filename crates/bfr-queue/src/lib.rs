//! bfr-queue
//!
//! The AMQP transport: connection/channel pooling, dead-letter topology,
//! publish helpers, and the three consumption patterns the fabric uses —
//! competing consumers (work queues), broadcast (fanout, one exclusive
//! queue per instance), and streaming (transient fanout with a sentinel-
//! terminated iterator).
//!
//! Topology is declared by BOTH the publisher and the consumer from the
//! same functions, so the two sides can never diverge on queue arguments.

use anyhow::{Context, Result};
use lapin::{Connection, ConnectionProperties};

pub mod consumer;
pub mod pool;
pub mod publish;
pub mod stream;
pub mod topology;

pub use consumer::{run_broadcast_consumer, run_consumer, BroadcastConsumer, QueueConsumer};
pub use pool::{AmqpPools, PooledChannel, PooledConnection};
pub use publish::{publish_broadcast, publish_message, publish_stream_message};
pub use stream::stream_from_exchange;

/// Dial one AMQP connection.
pub(crate) async fn dial(url: &str) -> Result<Connection> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .context("failed to connect to RabbitMQ")
}
