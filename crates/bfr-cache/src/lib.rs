//! bfr-cache
//!
//! The Redis layer: pending-execution reservations, the sync-result
//! rendezvous, metadata caches (with explicit negative entries), the
//! requirements cache, AI pricing/usage caches, the used-models registry,
//! the execution log stream, the queue tracker, and cross-process pub/sub
//! with a reconnecting subscriber.
//!
//! Failure posture: on a worker's terminal path every operation here is
//! best-effort — callers log a warning and continue, because the Postgres
//! row is the durable truth. Functions still return `Result` so non-terminal
//! callers can propagate.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

pub mod logs_stream;
pub mod meta;
pub mod pending;
pub mod pricing;
pub mod providers;
pub mod pubsub;
pub mod rendezvous;
pub mod requirements;
pub mod tracker;

pub use meta::MetaCacheLookup;
pub use pubsub::ResilientSubscriber;

/// Shared Redis handle. Cheap to clone; one per process, owned by the
/// top-level orchestrator and passed down explicitly.
#[derive(Clone)]
pub struct CacheClient {
    client: redis::Client,
    manager: ConnectionManager,
}

impl CacheClient {
    /// Connect and build the multiplexed connection manager.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        Ok(Self { client, manager })
    }

    /// A fresh command connection handle (multiplexed, auto-reconnecting).
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// The underlying client, for dedicated pub/sub connections which cannot
    /// share the multiplexed manager.
    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}
