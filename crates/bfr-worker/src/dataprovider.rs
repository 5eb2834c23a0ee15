//! Data-provider execution.
//!
//! Data providers are workflows that return option lists for form fields.
//! They run transiently (no durable receipt, 60-second budget) through the
//! same execution pool, and their results are cached aggressively — the
//! lists back dropdowns that refetch on every keystroke.

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use bfr_cache::CacheClient;
use bfr_pool::{CancelHandle, ExecutionPool};
use bfr_schemas::{Caller, ExecutionContext, RoiData, WorkflowMetadata};

/// Data providers get a short budget; anything slower belongs in a real
/// workflow.
pub const DATA_PROVIDER_TIMEOUT_SECONDS: u32 = 60;
/// Default option-cache TTL when the provider declares none.
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;

/// Run one data provider and return its options, cache-first.
#[allow(clippy::too_many_arguments)]
pub async fn run_data_provider(
    exec_pool: &ExecutionPool,
    cache: &CacheClient,
    meta: &WorkflowMetadata,
    caller: Caller,
    params: Value,
    config: Value,
    cache_ttl_seconds: Option<u64>,
    no_cache: bool,
) -> Result<Vec<Value>> {
    if !no_cache {
        match cache.get_data_provider_cache(&meta.name, &params).await {
            Ok(Some(options)) => {
                debug!(provider = %meta.name, "data provider cache hit");
                return Ok(options);
            }
            Ok(None) => {}
            Err(err) => warn!(provider = %meta.name, error = ?err, "provider cache read failed"),
        }
    }

    let context = ExecutionContext {
        execution_id: Uuid::new_v4(),
        workflow_id: Some(meta.id),
        name: meta.name.clone(),
        function_name: meta.function_name.clone(),
        workflow_code: None,
        code: None,
        parameters: params.clone(),
        caller,
        organization: None,
        config,
        tags: vec!["data_provider".to_string()],
        timeout_seconds: DATA_PROVIDER_TIMEOUT_SECONDS,
        transient: true,
        is_platform_admin: false,
        startup: None,
        roi: RoiData::default(),
        file_path: meta.file_path.clone(),
    };

    let outcome = exec_pool
        .execute(&context, DATA_PROVIDER_TIMEOUT_SECONDS, CancelHandle::never())
        .await
        .map_err(|err| anyhow!("data provider execution failed: {err}"))?;

    if outcome.status != "Success" {
        return Err(anyhow!(
            "data provider '{}' failed: {}",
            meta.name,
            outcome.error_message.unwrap_or_else(|| "unknown error".to_string())
        ));
    }

    let options = match outcome.result {
        Some(Value::Array(options)) => options,
        Some(other) => {
            return Err(anyhow!(
                "data provider '{}' must return a list, got {}",
                meta.name,
                type_name(&other)
            ))
        }
        None => Vec::new(),
    };

    if !no_cache {
        let ttl = cache_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECONDS);
        if let Err(err) = cache
            .set_data_provider_cache(&meta.name, &params, &options, ttl)
            .await
        {
            warn!(provider = %meta.name, error = ?err, "provider cache write failed");
        }
    }
    Ok(options)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_names_for_error_messages() {
        assert_eq!(type_name(&json!({"a": 1})), "object");
        assert_eq!(type_name(&json!("x")), "string");
        assert_eq!(type_name(&json!(null)), "null");
    }
}
