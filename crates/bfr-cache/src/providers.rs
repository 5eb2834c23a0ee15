//! Data-provider option cache.
//!
//! Provider results are cached aggressively (per-provider TTL, keyed by a
//! hash of the invocation parameters) because option lists back form
//! dropdowns that refetch constantly.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use serde_json::Value;
use sha2::{Digest, Sha256};

use bfr_schemas::keys;

use crate::CacheClient;

/// Stable hash of a provider's invocation parameters. Key order is
/// canonicalized so `{"a":1,"b":2}` and `{"b":2,"a":1}` share an entry.
pub fn params_hash(params: &Value) -> String {
    let canonical = canonicalize(params);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k}:{}", canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

impl CacheClient {
    pub async fn get_data_provider_cache(
        &self,
        provider: &str,
        params: &Value,
    ) -> Result<Option<Vec<Value>>> {
        let key = keys::data_provider(provider, &params_hash(params));
        let mut conn = self.conn();
        let payload: Option<String> = conn
            .get(&key)
            .await
            .context("data provider cache get failed")?;
        payload
            .map(|p| serde_json::from_str(&p).context("corrupt data provider cache entry"))
            .transpose()
    }

    pub async fn set_data_provider_cache(
        &self,
        provider: &str,
        params: &Value,
        options: &[Value],
        ttl_seconds: u64,
    ) -> Result<()> {
        let key = keys::data_provider(provider, &params_hash(params));
        let payload = serde_json::to_string(options).context("serialize provider options")?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(&key, payload, ttl_seconds.max(1))
            .await
            .context("data provider cache set failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_hash_is_order_insensitive() {
        let a = json!({"a": 1, "b": [1, 2], "c": {"x": true}});
        let b = json!({"c": {"x": true}, "b": [1, 2], "a": 1});
        assert_eq!(params_hash(&a), params_hash(&b));
    }

    #[test]
    fn params_hash_distinguishes_values() {
        assert_ne!(params_hash(&json!({"a": 1})), params_hash(&json!({"a": 2})));
        assert_ne!(params_hash(&json!([1, 2])), params_hash(&json!([2, 1])));
    }
}
