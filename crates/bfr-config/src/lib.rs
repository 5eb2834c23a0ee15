//! bfr-config
//!
//! Environment settings shared by every fabric binary, plus the scoped
//! config overlay used to build an execution's config map (organization
//! config deep-merged over global config).

use anyhow::{Context, Result};
use serde_json::Value;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_RABBITMQ_URL: &str = "RABBITMQ_URL";
pub const ENV_MAX_CONCURRENCY: &str = "BIFROST_MAX_CONCURRENCY";
pub const ENV_DAEMON_ADDR: &str = "BIFROST_DAEMON_ADDR";
pub const ENV_WORKSPACE_DIR: &str = "BIFROST_WORKSPACE_DIR";
pub const ENV_RUNNER_CMD: &str = "BIFROST_RUNNER_CMD";

/// Scope label for configuration that applies platform-wide.
pub const GLOBAL_SCOPE: &str = "GLOBAL";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub rabbitmq_url: String,
    /// AMQP prefetch for the workflow-execution consumer; also the worker's
    /// per-process concurrency bound.
    pub max_concurrency: u16,
    /// Local workspace the file-index collaborator syncs workflow sources
    /// into; the pool resolves `file_path` against it.
    pub workspace_dir: String,
    /// Runner program the execution pool spawns per run.
    pub runner_cmd: String,
}

impl Settings {
    /// Read settings from the environment. The three service URLs are
    /// required; everything else has a default.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require(ENV_DATABASE_URL)?,
            redis_url: require(ENV_REDIS_URL)?,
            rabbitmq_url: require(ENV_RABBITMQ_URL)?,
            max_concurrency: std::env::var(ENV_MAX_CONCURRENCY)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            workspace_dir: std::env::var(ENV_WORKSPACE_DIR)
                .unwrap_or_else(|_| "/tmp/bifrost/workspace".to_string()),
            runner_cmd: std::env::var(ENV_RUNNER_CMD)
                .unwrap_or_else(|_| "bifrost-runner".to_string()),
        })
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing env var {name}"))
}

// ---------------------------------------------------------------------------
// Scoped config overlay
// ---------------------------------------------------------------------------

/// Build the effective config for a scope: organization config deep-merged
/// over global config. `None` org config yields the global map unchanged.
pub fn resolve_scope_config(global: Value, org: Option<Value>) -> Value {
    let mut merged = match global {
        Value::Object(_) => global,
        _ => Value::Object(Default::default()),
    };
    if let Some(org_cfg) = org {
        deep_merge(&mut merged, org_cfg);
    }
    merged
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
pub fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn org_overlays_global() {
        let global = json!({"smtp": {"host": "mail", "port": 25}, "flag": true});
        let org = json!({"smtp": {"port": 587}, "name": "acme"});
        let merged = resolve_scope_config(global, Some(org));
        assert_eq!(merged["smtp"]["host"], "mail");
        assert_eq!(merged["smtp"]["port"], 587);
        assert_eq!(merged["flag"], true);
        assert_eq!(merged["name"], "acme");
    }

    #[test]
    fn missing_org_config_is_global() {
        let global = json!({"a": 1});
        assert_eq!(resolve_scope_config(global.clone(), None), global);
    }

    #[test]
    fn arrays_replace_instead_of_merging() {
        let mut dst = json!({"tags": ["a", "b"]});
        deep_merge(&mut dst, json!({"tags": ["c"]}));
        assert_eq!(dst["tags"], json!(["c"]));
    }

    #[test]
    fn non_object_global_normalizes_to_empty_map() {
        let merged = resolve_scope_config(Value::Null, Some(json!({"k": 1})));
        assert_eq!(merged["k"], 1);
    }
}
