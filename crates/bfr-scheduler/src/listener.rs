//! On-demand request dispatch.
//!
//! The resilient pub/sub subscriber delivers messages from the two
//! scheduler channels; this module routes them to the reindex and git-op
//! handlers. Undecodable requests are logged and dropped — the publisher
//! owns retries.

use std::path::Path;

use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use bfr_cache::pubsub::ChannelMessage;
use bfr_cache::CacheClient;
use bfr_schemas::channels;

use crate::gitops::{handle_git_operation, GitOpRequest};
use crate::reindex::{handle_reindex_request, ReindexRequest};

/// Route one pub/sub message to its handler.
pub async fn handle_scheduler_message(
    pool: &PgPool,
    cache: &CacheClient,
    workspace_dir: &Path,
    message: ChannelMessage,
) {
    match message.channel.as_str() {
        channels::SCHEDULER_REINDEX => {
            match serde_json::from_value::<ReindexRequest>(message.payload) {
                Ok(request) => handle_reindex_request(pool, cache, workspace_dir, &request).await,
                Err(err) => warn!(error = %err, "undecodable reindex request"),
            }
        }
        channels::SCHEDULER_GIT_OP => {
            match serde_json::from_value::<GitOpRequest>(message.payload) {
                Ok(request) => handle_git_operation(pool, cache, workspace_dir, &request).await,
                Err(err) => warn!(error = %err, "undecodable git-op request"),
            }
        }
        other => warn!(channel = other, "unknown scheduler channel"),
    }
}

/// The channel list the scheduler subscribes to.
pub fn scheduler_channels() -> Vec<String> {
    vec![
        channels::SCHEDULER_REINDEX.to_string(),
        channels::SCHEDULER_GIT_OP.to_string(),
    ]
}

/// Quick shape check used by tests and by callers that pre-filter noise.
pub fn looks_like_git_op(payload: &Value) -> bool {
    payload
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.starts_with("git_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_list_matches_constants() {
        let channels = scheduler_channels();
        assert_eq!(channels, vec!["bifrost:scheduler:reindex", "bifrost:scheduler:git-op"]);
    }

    #[test]
    fn git_op_shape_check() {
        assert!(looks_like_git_op(&json!({"type": "git_pull", "jobId": "j"})));
        assert!(!looks_like_git_op(&json!({"type": "reindex"})));
    }
}
