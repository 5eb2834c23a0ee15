//! WebSocket sessions and the broadcast hub.
//!
//! Each server instance keeps an in-memory `channel → connections` map and
//! delivers published payloads to every local subscriber. Cross-instance
//! delivery comes from every instance also being a Redis pattern
//! subscriber over the fabric's channel namespaces.
//!
//! Session contract:
//!   - auth failure: accept the upgrade, then close with code 4001 (the
//!     transport must be upgraded before a close code can be sent);
//!   - on success: auto-subscribe `user:<id>`, send `connected`;
//!   - client messages: `ping` → `pong`, `subscribe`/`unsubscribe` with a
//!     channel list; unknown types are ignored;
//!   - no replay on reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::auth::AuthUser;

/// Close code for authentication failure.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Channel-name patterns this instance relays from Redis.
pub const RELAY_PATTERNS: &[&str] = &[
    "execution:*",
    "user:*",
    "event_source:*",
    "git:*",
    "reindex:*",
];

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

type ConnId = u64;
type Outbox = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct HubInner {
    /// channel → subscribed connections
    channels: HashMap<String, HashSet<ConnId>>,
    /// connection → outbox + its channel set (for cleanup)
    connections: HashMap<ConnId, (Outbox, HashSet<String>)>,
}

/// Per-instance fan-out registry.
#[derive(Default)]
pub struct Hub {
    inner: RwLock<HubInner>,
    next_id: AtomicU64,
}

impl Hub {
    pub async fn register(&self, outbox: Outbox) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .await
            .connections
            .insert(id, (outbox, HashSet::new()));
        id
    }

    pub async fn subscribe(&self, conn: ConnId, channel: &str) {
        let mut inner = self.inner.write().await;
        if let Some((_, channels)) = inner.connections.get_mut(&conn) {
            channels.insert(channel.to_string());
        }
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn);
    }

    pub async fn unsubscribe(&self, conn: ConnId, channel: &str) {
        let mut inner = self.inner.write().await;
        if let Some((_, channels)) = inner.connections.get_mut(&conn) {
            channels.remove(channel);
        }
        if let Some(set) = inner.channels.get_mut(channel) {
            set.remove(&conn);
            if set.is_empty() {
                inner.channels.remove(channel);
            }
        }
    }

    /// Remove the connection from every channel set.
    pub async fn drop_connection(&self, conn: ConnId) {
        let mut inner = self.inner.write().await;
        if let Some((_, channels)) = inner.connections.remove(&conn) {
            for channel in channels {
                if let Some(set) = inner.channels.get_mut(&channel) {
                    set.remove(&conn);
                    if set.is_empty() {
                        inner.channels.remove(&channel);
                    }
                }
            }
        }
    }

    /// Deliver a payload to every local subscriber of the channel.
    pub async fn dispatch(&self, channel: &str, payload: &str) {
        let inner = self.inner.read().await;
        let Some(subscribers) = inner.channels.get(channel) else {
            return;
        };
        for conn in subscribers {
            if let Some((outbox, _)) = inner.connections.get(conn) {
                // A full/closed outbox means the session is going away;
                // its reader will clean up.
                let _ = outbox.send(payload.to_string());
            }
        }
    }

    pub async fn channels_of(&self, conn: ConnId) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&conn)
            .map(|(_, channels)| {
                let mut list: Vec<String> = channels.iter().cloned().collect();
                list.sort();
                list
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Redis relay
// ---------------------------------------------------------------------------

/// Pattern-subscribe the fabric namespaces and feed the hub. Reconnects
/// with backoff forever; messages published during a gap are lost (no
/// replay).
pub fn spawn_relay(client: redis::Client, hub: Arc<Hub>) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_millis(500);
        loop {
            match relay_once(&client, &hub).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(error = %err, "ws relay connection lost; reconnecting");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    });
}

async fn relay_once(client: &redis::Client, hub: &Hub) -> anyhow::Result<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    for pattern in RELAY_PATTERNS {
        pubsub.psubscribe(*pattern).await?;
    }
    info!("ws relay subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let Ok(payload) = msg.get_payload::<String>() else {
            continue;
        };
        hub.dispatch(&channel, &payload).await;
    }
    anyhow::bail!("ws relay stream ended")
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
}

/// Run one authenticated session to completion. `extra_channels` seeds
/// subscriptions beyond the automatic `user:<id>` (the single-execution
/// convenience endpoint).
pub async fn run_session(socket: WebSocket, user: AuthUser, extra_channels: Vec<String>, hub: Arc<Hub>) {
    let (mut sink, mut source) = socket.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<String>();

    let conn = hub.register(outbox).await;
    let user_channel = bfr_schemas::channels::user(user.user_id);
    hub.subscribe(conn, &user_channel).await;
    for channel in &extra_channels {
        hub.subscribe(conn, channel).await;
    }

    let connected = json!({
        "type": "connected",
        "userId": user.user_id,
        "channels": hub.channels_of(conn).await,
    });
    if sink
        .send(Message::Text(connected.to_string()))
        .await
        .is_err()
    {
        hub.drop_connection(conn).await;
        return;
    }
    debug!(conn, user_id = %user.user_id, "ws session connected");

    loop {
        tokio::select! {
            outgoing = inbox.recv() => {
                let Some(payload) = outgoing else { break };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        // Malformed JSON and unknown types are ignored.
                        let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
                            continue;
                        };
                        match parsed {
                            ClientMessage::Ping => {
                                if sink
                                    .send(Message::Text(json!({"type": "pong"}).to_string()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            ClientMessage::Subscribe { channels } => {
                                for channel in channels {
                                    hub.subscribe(conn, &channel).await;
                                }
                            }
                            ClientMessage::Unsubscribe { channels } => {
                                for channel in channels {
                                    hub.unsubscribe(conn, &channel).await;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    hub.drop_connection(conn).await;
    debug!(conn, "ws session closed");
}

/// Accept-then-close for failed authentication: the transport must be
/// upgraded before a close code can reach the client.
pub async fn close_unauthorized(socket: WebSocket) {
    let mut socket = socket;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: "authentication failed".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_and_unknown_types_are_rejected() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "ping"}"#).unwrap(),
            ClientMessage::Ping
        ));
        match serde_json::from_str::<ClientMessage>(
            r#"{"type": "subscribe", "channels": ["execution:1", "user:2"]}"#,
        )
        .unwrap()
        {
            ClientMessage::Subscribe { channels } => assert_eq!(channels.len(), 2),
            other => panic!("expected subscribe, got {:?}", std::mem::discriminant(&other)),
        }
        // Unknown types fail to parse; the session loop ignores them.
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "shout"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[tokio::test]
    async fn dispatch_reaches_only_subscribers() {
        let hub = Hub::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.register(tx_a).await;
        let b = hub.register(tx_b).await;

        hub.subscribe(a, "execution:1").await;
        hub.subscribe(b, "execution:2").await;

        hub.dispatch("execution:1", "{\"type\":\"execution_update\"}").await;
        assert_eq!(rx_a.try_recv().unwrap(), "{\"type\":\"execution_update\"}");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_connection_removes_every_subscription() {
        let hub = Hub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.register(tx).await;
        hub.subscribe(conn, "user:x").await;
        hub.subscribe(conn, "execution:y").await;

        hub.drop_connection(conn).await;
        hub.dispatch("user:x", "gone").await;
        hub.dispatch("execution:y", "gone").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_per_channel() {
        let hub = Hub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.register(tx).await;
        hub.subscribe(conn, "a").await;
        hub.subscribe(conn, "b").await;
        hub.unsubscribe(conn, "a").await;

        hub.dispatch("a", "one").await;
        hub.dispatch("b", "two").await;
        assert_eq!(rx.try_recv().unwrap(), "two");
        assert!(rx.try_recv().is_err());
    }
}
