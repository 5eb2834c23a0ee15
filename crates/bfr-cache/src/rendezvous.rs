//! Sync-result rendezvous.
//!
//! The worker pushes exactly one terminal payload per sync execution; the
//! intake side blocks on BLPOP for the workflow timeout plus margin. A
//! caller-side timeout never cancels the work — the list TTL covers the
//! straggler payload.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use uuid::Uuid;

use bfr_schemas::{keys, RendezvousResult};

use crate::CacheClient;

/// Margin added to the workflow timeout on both the list TTL and the
/// caller's blocking wait.
pub const RENDEZVOUS_MARGIN_SECS: u64 = 30;

impl CacheClient {
    /// Append the terminal payload and arm the TTL. Called exactly once per
    /// terminal path of a sync execution.
    pub async fn push_result(
        &self,
        execution_id: Uuid,
        result: &RendezvousResult,
        timeout_seconds: u64,
    ) -> Result<()> {
        let key = keys::result(execution_id);
        let payload = serde_json::to_string(result).context("serialize rendezvous result")?;
        let ttl = timeout_seconds + RENDEZVOUS_MARGIN_SECS;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .rpush(&key, payload)
            .expire(&key, ttl as i64)
            .query_async(&mut conn)
            .await
            .context("push_result failed")?;
        Ok(())
    }

    /// Blocking pop; `None` on timeout.
    pub async fn wait_for_result(
        &self,
        execution_id: Uuid,
        timeout_seconds: u64,
    ) -> Result<Option<RendezvousResult>> {
        let key = keys::result(execution_id);
        let mut conn = self.conn();
        let popped: Option<(String, String)> = conn
            .blpop(&key, timeout_seconds as f64)
            .await
            .context("wait_for_result failed")?;

        match popped {
            Some((_list, payload)) => Ok(Some(
                serde_json::from_str(&payload).context("corrupt rendezvous payload")?,
            )),
            None => Ok(None),
        }
    }
}
