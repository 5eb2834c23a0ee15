//! Cache-first workflow metadata resolution.
//!
//! Shared by the consumer (step 4 of the pipeline) and the intake layer
//! (sync-mode detection, timeout sizing). Misses populate the cache; absent
//! workflows populate the negative cache so replayed messages against a
//! deleted id stop probing the DB.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use bfr_cache::{CacheClient, MetaCacheLookup};
use bfr_schemas::WorkflowMetadata;

pub async fn get_workflow_metadata(
    cache: &CacheClient,
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Option<WorkflowMetadata>> {
    match cache.get_workflow_metadata_cache(workflow_id).await {
        Ok(MetaCacheLookup::Hit(meta)) => {
            debug!(%workflow_id, "workflow metadata cache hit");
            return Ok(Some(*meta));
        }
        Ok(MetaCacheLookup::NegativeHit) => {
            debug!(%workflow_id, "workflow metadata negative cache hit");
            return Ok(None);
        }
        Ok(MetaCacheLookup::Miss) => {}
        Err(err) => {
            // Cache trouble never blocks resolution; fall through to the DB.
            warn!(%workflow_id, error = ?err, "workflow metadata cache read failed");
        }
    }

    let meta = bfr_db::workflows::fetch_workflow_metadata(pool, workflow_id).await?;
    match &meta {
        Some(meta) => {
            if let Err(err) = cache.set_workflow_metadata_cache(meta).await {
                warn!(%workflow_id, error = ?err, "workflow metadata cache write failed");
            }
        }
        None => {
            if let Err(err) = cache.set_workflow_metadata_negative(workflow_id).await {
                warn!(%workflow_id, error = ?err, "workflow negative cache write failed");
            }
        }
    }
    Ok(meta)
}
