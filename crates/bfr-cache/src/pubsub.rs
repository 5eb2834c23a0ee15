//! Cross-process pub/sub.
//!
//! Publishing is fire-and-forget JSON on a named channel. Subscription uses
//! a dedicated connection (pub/sub cannot share the multiplexed manager)
//! wrapped in a reconnect loop: any transport error tears the connection
//! down, backs off exponentially, re-subscribes the full channel list and
//! resumes. Messages published during the gap are lost — publishers must
//! tolerate drop.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bfr_schemas::BusMessage;

use crate::CacheClient;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

impl CacheClient {
    /// Publish a bus message. Callers on terminal write paths treat errors
    /// as warnings — a publish must never block a DB commit.
    pub async fn publish(&self, channel: &str, message: &BusMessage) -> Result<()> {
        let payload = serde_json::to_string(message).context("serialize bus message")?;
        self.publish_raw(channel, &payload).await
    }

    pub async fn publish_raw(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("publish to {channel} failed"))?;
        Ok(())
    }
}

/// A subscription message delivered to the consumer side.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Value,
}

/// Auto-reconnecting pub/sub listener. Forwards every decoded message into
/// the provided mpsc sender; gaps are reported only by the reconnect log
/// line (no replay).
pub struct ResilientSubscriber {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl ResilientSubscriber {
    pub fn spawn(
        client: redis::Client,
        channels: Vec<String>,
        tx: mpsc::Sender<ChannelMessage>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(listen_loop(client, channels, tx, stop_rx));
        Self { handle, stop_tx }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn listen_loop(
    client: redis::Client,
    channels: Vec<String>,
    tx: mpsc::Sender<ChannelMessage>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if *stop_rx.borrow() {
            return;
        }

        match subscribe_once(&client, &channels, &tx, &mut stop_rx).await {
            Ok(()) => return, // clean stop
            Err(err) => {
                warn!(error = %err, delay_ms = backoff.as_millis() as u64,
                      "pub/sub connection lost; reconnecting");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop_rx.changed() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// One connection lifetime: subscribe everything, pump messages until the
/// stream ends or a stop is requested. A successful pass resets the caller's
/// backoff only implicitly (errors restart it from where it was — cheap and
/// close enough for a reconnect path).
async fn subscribe_once(
    client: &redis::Client,
    channels: &[String],
    tx: &mpsc::Sender<ChannelMessage>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("pub/sub connect failed")?;
    for channel in channels {
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("subscribe {channel} failed"))?;
    }
    info!(channels = channels.len(), "pub/sub listener subscribed");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            maybe_msg = stream.next() => {
                let Some(msg) = maybe_msg else {
                    anyhow::bail!("pub/sub stream ended");
                };
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(error = %err, %channel, "undecodable pub/sub payload");
                        continue;
                    }
                };
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => {
                        if tx.send(ChannelMessage { channel, payload: value }).await.is_err() {
                            // Receiver gone — treat as a stop.
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, %channel, "ignoring non-JSON pub/sub payload");
                    }
                }
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
