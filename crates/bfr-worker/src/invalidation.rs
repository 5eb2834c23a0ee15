//! Cache-invalidation broadcast consumer.
//!
//! The file-index collaborator publishes to a fanout exchange whenever a
//! workflow record changes; every worker instance drops its cached
//! metadata for that id so the next claim re-reads the DB. Broadcast (not
//! competing-consumer) because every instance holds its own view of the
//! cache-backed hot path.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use bfr_cache::CacheClient;
use bfr_queue::BroadcastConsumer;

/// Fanout exchange the file indexer publishes invalidations on.
pub const WORKFLOW_INVALIDATION_EXCHANGE: &str = "workflow-cache-invalidation";

pub struct WorkflowCacheInvalidator {
    cache: CacheClient,
}

impl WorkflowCacheInvalidator {
    pub fn new(cache: CacheClient) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl BroadcastConsumer for WorkflowCacheInvalidator {
    fn exchange_name(&self) -> &str {
        WORKFLOW_INVALIDATION_EXCHANGE
    }

    async fn handle(&self, body: Value) -> Result<()> {
        let Some(workflow_id) = body
            .get("workflow_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok())
        else {
            warn!("invalidation message without workflow_id");
            return Ok(());
        };

        self.cache.invalidate_workflow_metadata(workflow_id).await?;
        info!(%workflow_id, "workflow metadata cache invalidated");
        Ok(())
    }
}
