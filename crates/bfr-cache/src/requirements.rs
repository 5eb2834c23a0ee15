//! Requirements cache.
//!
//! `bifrost:requirements:content` holds `{content, hash}` for 24 hours.
//! The warmer reads the file-index mirror in Postgres; writes go through
//! both stores so readers never observe a stale hash.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use bfr_schemas::keys;

use crate::CacheClient;

pub const REQUIREMENTS_TTL_SECS: u64 = 24 * 3600;
pub const REQUIREMENTS_PATH: &str = "requirements.txt";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementsEntry {
    pub content: String,
    pub hash: String,
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

impl CacheClient {
    /// Boot-time warmer. Returns false (not an error) when the file has
    /// never been indexed.
    pub async fn warm_requirements_cache(&self, pool: &PgPool) -> Result<bool> {
        let Some(content) =
            bfr_db::workflows::fetch_platform_file(pool, REQUIREMENTS_PATH).await?
        else {
            return Ok(false);
        };
        self.set_requirements_cache(&content).await?;
        Ok(true)
    }

    /// Write-through update: upsert the DB row, then refresh the cache.
    pub async fn update_requirements(&self, pool: &PgPool, content: &str) -> Result<()> {
        bfr_db::workflows::upsert_platform_file(pool, REQUIREMENTS_PATH, content).await?;
        self.set_requirements_cache(content).await
    }

    async fn set_requirements_cache(&self, content: &str) -> Result<()> {
        let entry = RequirementsEntry {
            content: content.to_string(),
            hash: content_hash(content),
        };
        let payload = serde_json::to_string(&entry).context("serialize requirements entry")?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(keys::REQUIREMENTS_CONTENT, payload, REQUIREMENTS_TTL_SECS)
            .await
            .context("set requirements cache failed")?;
        Ok(())
    }

    pub async fn get_requirements_cache(&self) -> Result<Option<RequirementsEntry>> {
        let mut conn = self.conn();
        let payload: Option<String> = conn
            .get(keys::REQUIREMENTS_CONTENT)
            .await
            .context("get requirements cache failed")?;
        payload
            .map(|p| serde_json::from_str(&p).context("corrupt requirements entry"))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_sha256() {
        let h = content_hash("requests==2.31.0\n");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("requests==2.31.0\n"));
        assert_ne!(h, content_hash("requests==2.32.0\n"));
    }
}
