//! Queue tracker — the observational set of execution ids believed to be
//! sitting in the broker. Intake adds, the worker removes on claim. Absence
//! is never an error.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use uuid::Uuid;

use bfr_schemas::keys;

use crate::CacheClient;

impl CacheClient {
    pub async fn add_to_queue_tracker(&self, execution_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .sadd(keys::QUEUED_SET, execution_id.to_string())
            .await
            .context("add_to_queue_tracker failed")?;
        Ok(())
    }

    pub async fn remove_from_queue_tracker(&self, execution_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .srem(keys::QUEUED_SET, execution_id.to_string())
            .await
            .context("remove_from_queue_tracker failed")?;
        Ok(())
    }

    pub async fn queued_execution_ids(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .smembers(keys::QUEUED_SET)
            .await
            .context("queued_execution_ids failed")?;
        Ok(members
            .into_iter()
            .filter_map(|m| m.parse().ok())
            .collect())
    }
}
