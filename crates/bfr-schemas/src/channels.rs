//! Pub/sub channel naming.
//!
//! Channel strings are constructed here and nowhere else. In particular the
//! event-source channel is `event_source:<id>` (underscore) everywhere —
//! publisher and subscriber share these constructors so the name cannot
//! drift between call sites.

use uuid::Uuid;

/// Per-execution status channel; carries `execution_update` payloads.
pub fn execution(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

/// Per-user channel; sessions are auto-subscribed on connect and receive
/// `history_update` payloads.
pub fn user(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

/// Per-event-source channel; carries `event_created`, `event_updated` and
/// `deliveries_queued` payloads.
pub fn event_source(event_source_id: Uuid) -> String {
    format!("event_source:{event_source_id}")
}

/// Per-job progress channel for on-demand git operations.
pub fn git_job(job_id: &str) -> String {
    format!("git:{job_id}")
}

/// Per-job progress channel for on-demand reindex requests.
pub fn reindex_job(job_id: &str) -> String {
    format!("reindex:{job_id}")
}

/// On-demand reindex request channel (API → scheduler).
pub const SCHEDULER_REINDEX: &str = "bifrost:scheduler:reindex";

/// On-demand git operation request channel (API → scheduler).
pub const SCHEDULER_GIT_OP: &str = "bifrost:scheduler:git-op";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_source_channel_uses_underscore() {
        let id = Uuid::nil();
        let ch = event_source(id);
        assert!(ch.starts_with("event_source:"));
        assert!(!ch.contains("event-source"));
    }
}
