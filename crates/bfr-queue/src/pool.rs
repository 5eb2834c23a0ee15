//! Connection and channel pooling.
//!
//! Consumers hold a dedicated connection for their lifetime (consumption
//! cannot cleanly share a channel with publishes); publishers use the
//! short-lived acquire-publish-release pattern. Pool sizing mirrors the
//! deployment: expected consumers plus two of headroom.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{Channel, Connection};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::dial;

/// Connection pool max: 4 long-lived consumers + 2 headroom.
pub const MAX_CONNECTIONS: usize = 6;
/// Channel pool max for short-lived publish channels.
pub const MAX_CHANNELS: usize = 10;

struct PoolInner {
    url: String,
    idle_connections: Mutex<Vec<Connection>>,
    connection_permits: Semaphore,
    idle_channels: Mutex<Vec<Channel>>,
    channel_permits: Semaphore,
}

/// Process-wide AMQP pools. Clone is cheap (one shared inner).
#[derive(Clone)]
pub struct AmqpPools {
    inner: Arc<PoolInner>,
}

impl AmqpPools {
    pub fn new(rabbitmq_url: &str) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                url: rabbitmq_url.to_string(),
                idle_connections: Mutex::new(Vec::new()),
                connection_permits: Semaphore::new(MAX_CONNECTIONS),
                idle_channels: Mutex::new(Vec::new()),
                channel_permits: Semaphore::new(MAX_CHANNELS),
            }),
        }
    }

    /// Acquire a pooled connection; dead idles are discarded and replaced.
    pub async fn connection(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .connection_permits
            .acquire()
            .await
            .context("connection pool closed")?;
        permit.forget();

        let reused = {
            let mut idle = self.inner.idle_connections.lock().await;
            loop {
                match idle.pop() {
                    Some(conn) if conn.status().connected() => break Some(conn),
                    Some(_dead) => continue,
                    None => break None,
                }
            }
        };

        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!("dialing new AMQP connection");
                dial(&self.inner.url).await?
            }
        };

        Ok(PooledConnection {
            pool: self.inner.clone(),
            conn: Some(conn),
        })
    }

    /// A connection owned for the caller's lifetime, outside the pooled
    /// rotation — consumers use this so a long-lived basic_consume never
    /// starves publishers.
    pub async fn dedicated_connection(&self) -> Result<Connection> {
        dial(&self.inner.url).await
    }

    /// Acquire a pooled channel for a publish burst.
    pub async fn channel(&self) -> Result<PooledChannel> {
        let permit = self
            .inner
            .channel_permits
            .acquire()
            .await
            .context("channel pool closed")?;
        permit.forget();

        let reused = {
            let mut idle = self.inner.idle_channels.lock().await;
            loop {
                match idle.pop() {
                    Some(ch) if ch.status().connected() => break Some(ch),
                    Some(_dead) => continue,
                    None => break None,
                }
            }
        };

        let channel = match reused {
            Some(ch) => ch,
            None => {
                let conn = self.connection().await?;
                let ch = conn
                    .get()
                    .create_channel()
                    .await
                    .context("create_channel failed")?;
                drop(conn); // connection returns to the pool; the channel outlives it
                ch
            }
        };

        Ok(PooledChannel {
            pool: self.inner.clone(),
            channel: Some(channel),
        })
    }

    /// Close every idle handle. In-flight guards drain naturally.
    pub async fn close(&self) {
        let mut channels = self.inner.idle_channels.lock().await;
        for ch in channels.drain(..) {
            let _ = ch.close(200, "shutdown").await;
        }
        drop(channels);
        let mut conns = self.inner.idle_connections.lock().await;
        for conn in conns.drain(..) {
            let _ = conn.close(200, "shutdown").await;
        }
    }
}

/// Guard returning the connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl PooledConnection {
    pub fn get(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.status().connected() {
                if let Ok(mut idle) = self.pool.idle_connections.try_lock() {
                    idle.push(conn);
                }
            }
        }
        self.pool.connection_permits.add_permits(1);
    }
}

/// Guard returning the channel to the pool on drop.
pub struct PooledChannel {
    pool: Arc<PoolInner>,
    channel: Option<Channel>,
}

impl PooledChannel {
    pub fn get(&self) -> &Channel {
        self.channel.as_ref().expect("channel present until drop")
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(ch) = self.channel.take() {
            if ch.status().connected() {
                if let Ok(mut idle) = self.pool.idle_channels.try_lock() {
                    idle.push(ch);
                }
            }
        }
        self.pool.channel_permits.add_permits(1);
    }
}
