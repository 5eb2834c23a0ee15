//! Pending-execution reservations.
//!
//! Stored as a hash: field `data` holds the serialized context, field
//! `cancelled` is a separate flag so cancellation can flip it atomically
//! without read-modify-write races against the worker's claim.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use uuid::Uuid;

use bfr_schemas::{keys, PendingExecution};

use crate::CacheClient;

impl CacheClient {
    /// Write the reservation. Idempotent; no TTL — the worker deletes it on
    /// every terminal outcome.
    pub async fn set_pending_execution(
        &self,
        execution_id: Uuid,
        pending: &PendingExecution,
    ) -> Result<()> {
        let key = keys::pending(execution_id);
        let data = serde_json::to_string(pending).context("serialize pending execution")?;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .hset(&key, "data", data)
            .hset(&key, "cancelled", i32::from(pending.cancelled))
            .query_async(&mut conn)
            .await
            .context("set_pending_execution failed")?;
        Ok(())
    }

    /// Full context or `None` when already reaped.
    pub async fn get_pending_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<PendingExecution>> {
        let key = keys::pending(execution_id);
        let mut conn = self.conn();
        let (data, cancelled): (Option<String>, Option<i32>) = redis::pipe()
            .hget(&key, "data")
            .hget(&key, "cancelled")
            .query_async(&mut conn)
            .await
            .context("get_pending_execution failed")?;

        let Some(data) = data else { return Ok(None) };
        let mut pending: PendingExecution =
            serde_json::from_str(&data).context("corrupt pending execution payload")?;
        pending.cancelled = cancelled.unwrap_or(0) != 0;
        Ok(Some(pending))
    }

    /// Idempotent delete.
    pub async fn delete_pending_execution(&self, execution_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .del(keys::pending(execution_id))
            .await
            .context("delete_pending_execution failed")?;
        Ok(())
    }

    /// Set the cancellation intent. No-op when the reservation is already
    /// gone (the script guards on EXISTS so we never resurrect a key).
    /// Returns whether the flag was set.
    pub async fn mark_cancelled(&self, execution_id: Uuid) -> Result<bool> {
        let script = redis::Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                redis.call('HSET', KEYS[1], 'cancelled', '1')
                return 1
            end
            return 0
            "#,
        );
        let mut conn = self.conn();
        let set: i32 = script
            .key(keys::pending(execution_id))
            .invoke_async(&mut conn)
            .await
            .context("mark_cancelled failed")?;
        Ok(set == 1)
    }
}
