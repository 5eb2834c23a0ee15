//! Workflow metadata cache.
//!
//! Positive entries live for hours; a "workflow does not exist" answer is
//! cached too (short TTL) so a storm of enqueues against a deleted id does
//! not turn into a storm of DB probes.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use uuid::Uuid;

use bfr_schemas::{keys, WorkflowMetadata};

use crate::CacheClient;

/// Positive entry TTL.
pub const META_TTL_SECS: i64 = 6 * 3600;
/// Negative entry TTL.
pub const META_NEGATIVE_TTL_SECS: i64 = 60;

/// Outcome of a metadata cache probe.
#[derive(Debug, Clone)]
pub enum MetaCacheLookup {
    Hit(Box<WorkflowMetadata>),
    /// The absence of the workflow is itself cached.
    NegativeHit,
    Miss,
}

impl CacheClient {
    pub async fn get_workflow_metadata_cache(
        &self,
        workflow_id: Uuid,
    ) -> Result<MetaCacheLookup> {
        let key = keys::workflow_meta(workflow_id);
        let mut conn = self.conn();
        let (missing, data): (Option<i32>, Option<String>) = redis::pipe()
            .hget(&key, "missing")
            .hget(&key, "data")
            .query_async(&mut conn)
            .await
            .context("get_workflow_metadata_cache failed")?;

        if missing.unwrap_or(0) == 1 {
            return Ok(MetaCacheLookup::NegativeHit);
        }
        match data {
            Some(json) => Ok(MetaCacheLookup::Hit(Box::new(
                serde_json::from_str(&json).context("corrupt workflow metadata payload")?,
            ))),
            None => Ok(MetaCacheLookup::Miss),
        }
    }

    /// Idempotent positive write: same metadata in, same Redis state out.
    pub async fn set_workflow_metadata_cache(&self, meta: &WorkflowMetadata) -> Result<()> {
        let key = keys::workflow_meta(meta.id);
        let json = serde_json::to_string(meta).context("serialize workflow metadata")?;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .del(&key)
            .hset(&key, "data", json)
            .expire(&key, META_TTL_SECS)
            .query_async(&mut conn)
            .await
            .context("set_workflow_metadata_cache failed")?;
        Ok(())
    }

    /// Record that the workflow does not exist (or is inactive).
    pub async fn set_workflow_metadata_negative(&self, workflow_id: Uuid) -> Result<()> {
        let key = keys::workflow_meta(workflow_id);
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .del(&key)
            .hset(&key, "missing", 1)
            .expire(&key, META_NEGATIVE_TTL_SECS)
            .query_async(&mut conn)
            .await
            .context("set_workflow_metadata_negative failed")?;
        Ok(())
    }

    /// Drop one cached entry (file-index updates call this on re-index).
    pub async fn invalidate_workflow_metadata(&self, workflow_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .del(keys::workflow_meta(workflow_id))
            .await
            .context("invalidate_workflow_metadata failed")?;
        Ok(())
    }
}
