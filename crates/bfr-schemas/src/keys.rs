//! Redis key naming.
//!
//! One constructor per key family. TTLs live with the cache layer; this
//! module only owns the strings.

use uuid::Uuid;

/// Pending execution context, written by intake before the queue message.
/// No TTL — deleted by the worker on any terminal outcome.
pub fn pending(execution_id: Uuid) -> String {
    format!("bifrost:pending:{execution_id}")
}

/// Sync rendezvous list. The worker pushes exactly one terminal payload;
/// the intake side BLPOPs with the workflow timeout plus margin.
pub fn result(execution_id: Uuid) -> String {
    format!("bifrost:result:{execution_id}")
}

/// Workflow metadata cache hash.
pub fn workflow_meta(workflow_id: Uuid) -> String {
    format!("bifrost:wf:meta:{workflow_id}")
}

/// Execution log stream (XADD by the runner, drained by the worker's
/// flusher). The stream is the single source of truth for logs.
pub fn log_stream(execution_id: Uuid) -> String {
    format!("bifrost:logs:{execution_id}")
}

/// Set of execution ids currently sitting in the queue (observational).
pub const QUEUED_SET: &str = "bifrost:queued";

/// Cached requirements.txt content + SHA-256, 24h TTL.
pub const REQUIREMENTS_CONTENT: &str = "bifrost:requirements:content";

/// Model pricing cache, including explicit negative entries.
pub fn ai_pricing(provider: &str, model: &str) -> String {
    format!("ai_pricing:{provider}:{model}")
}

/// Scan pattern covering every usage aggregate (the AI usage service
/// writes the keys; pricing backfills sweep them via this pattern).
pub const AI_USAGE_TOTALS_PATTERN: &str = "ai_usage_totals:*";

/// Distinct (provider, model) pairs seen since last flush.
pub const AI_USED_MODELS: &str = "ai_used_models";

/// Data-provider option cache, keyed by provider name and a hash of the
/// invocation parameters.
pub fn data_provider(provider: &str, params_hash: &str) -> String {
    format!("bifrost:dp:{provider}:{params_hash}")
}
