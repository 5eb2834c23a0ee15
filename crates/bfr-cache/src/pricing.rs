//! AI pricing and usage caches.
//!
//! Pricing lookups cache misses explicitly ("not found" entries share the
//! hit TTL) so unmodeled models do not hammer the DB. Backfills invalidate
//! every usage aggregate with a batched SCAN + DEL sweep — never KEYS, which
//! would block the server on a large keyspace.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

use bfr_schemas::keys;

use crate::CacheClient;

pub const PRICING_TTL_SECS: u64 = 3600;
const SCAN_BATCH: usize = 200;

/// Cached pricing entry; `found = false` is the stored negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_price_per_mtok: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_price_per_mtok: Option<f64>,
}

impl CacheClient {
    /// Cache-first pricing lookup with a DB probe on miss; both outcomes of
    /// the probe are cached for the same TTL.
    pub async fn get_model_pricing(
        &self,
        pool: &PgPool,
        provider: &str,
        model: &str,
    ) -> Result<PricingEntry> {
        let key = keys::ai_pricing(provider, model);
        let mut conn = self.conn();

        let cached: Option<String> = conn.get(&key).await.context("pricing cache get failed")?;
        if let Some(payload) = cached {
            return serde_json::from_str(&payload).context("corrupt pricing entry");
        }

        let entry = match bfr_db::workflows::fetch_model_pricing(pool, provider, model).await? {
            Some((input, output)) => PricingEntry {
                found: true,
                input_price_per_mtok: Some(input),
                output_price_per_mtok: Some(output),
            },
            None => PricingEntry {
                found: false,
                input_price_per_mtok: None,
                output_price_per_mtok: None,
            },
        };

        let payload = serde_json::to_string(&entry).context("serialize pricing entry")?;
        let _: () = conn
            .set_ex(&key, payload, PRICING_TTL_SECS)
            .await
            .context("pricing cache set failed")?;
        Ok(entry)
    }

    /// Invalidate every usage aggregate after a pricing backfill. Batched
    /// SCAN; returns the number of keys deleted.
    pub async fn invalidate_usage_aggregates(&self) -> Result<u64> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(keys::AI_USAGE_TOTALS_PATTERN)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .context("usage aggregate scan failed")?;

            if !batch.is_empty() {
                let n: u64 = conn
                    .del(&batch)
                    .await
                    .context("usage aggregate delete failed")?;
                deleted += n;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(deleted, "usage aggregates invalidated");
        Ok(deleted)
    }

    /// Record one (provider, model) pair — O(1) SADD.
    pub async fn add_used_model(&self, provider: &str, model: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .sadd(keys::AI_USED_MODELS, format!("{provider}:{model}"))
            .await
            .context("add_used_model failed")?;
        Ok(())
    }

    /// The registry, repopulated from a DB distinct-scan when the set is
    /// empty (cold cache after a flush or restart).
    pub async fn get_used_models(&self, pool: &PgPool) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .smembers(keys::AI_USED_MODELS)
            .await
            .context("get_used_models failed")?;
        if !members.is_empty() {
            return Ok(members);
        }

        let pairs = bfr_db::workflows::distinct_used_models(pool).await?;
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let members: Vec<String> = pairs
            .into_iter()
            .map(|(provider, model)| format!("{provider}:{model}"))
            .collect();
        let _: () = conn
            .sadd(keys::AI_USED_MODELS, &members)
            .await
            .context("used models repopulate failed")?;
        Ok(members)
    }
}
