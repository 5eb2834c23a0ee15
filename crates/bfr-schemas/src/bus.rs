//! Pub/sub payloads relayed to WebSocket subscribers.
//!
//! One tagged enum covers every cross-process notification the fabric
//! publishes. Publishers must never block a DB commit on these: payloads are
//! fire-and-forget and subscribers tolerate loss.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Delivery status counts attached to event broadcasts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventCounts {
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub failed_count: i64,
    #[serde(default)]
    pub queued_count: i64,
    #[serde(default)]
    pub pending_count: i64,
    #[serde(default)]
    pub delivery_count: i64,
}

/// Snapshot of one event carried inside `event_*` broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: Uuid,
    pub event_source_id: Uuid,
    pub event_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(flatten)]
    pub counts: EventCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Published on `execution:<id>` for every status transition.
    ExecutionUpdate {
        execution_id: Uuid,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Published on `user:<id>` so history views update live.
    HistoryUpdate {
        execution_id: Uuid,
        status: String,
        workflow_name: String,
        executed_by: Uuid,
        executed_by_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        org_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },
    /// Published on `event_source:<id>` when an event row is created.
    EventCreated { event: EventSummary },
    /// Published on `event_source:<id>` as deliveries complete.
    EventUpdated { event: EventSummary },
    /// Published on `event_source:<id>` after the deferred enqueue pass.
    DeliveriesQueued { event: EventSummary },
    /// Published on `git:<job_id>` while an on-demand git op runs.
    GitOpProgress {
        job_id: String,
        phase: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Published on `git:<job_id>` exactly once per job.
    GitOpCompleted {
        job_id: String,
        /// "success" | "conflict" | "failed"
        status: String,
        result_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Published on `reindex:<job_id>` while a reindex runs.
    ReindexProgress {
        job_id: String,
        phase: String,
        current: u64,
        total: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_file: Option<String>,
    },
    /// Published on `reindex:<job_id>` on success.
    ReindexCompleted {
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        counts: Option<Value>,
    },
    /// Published on `reindex:<job_id>` on failure.
    ReindexFailed { job_id: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_update_wire_shape() {
        let msg = BusMessage::ExecutionUpdate {
            execution_id: Uuid::nil(),
            status: "Running".to_string(),
            data: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "execution_update");
        assert_eq!(json["status"], "Running");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn event_summary_counts_are_flattened() {
        let msg = BusMessage::DeliveriesQueued {
            event: EventSummary {
                id: Uuid::nil(),
                event_source_id: Uuid::nil(),
                event_type: "order.created".to_string(),
                status: "Processing".to_string(),
                received_at: None,
                source_ip: None,
                counts: EventCounts {
                    queued_count: 2,
                    delivery_count: 2,
                    ..Default::default()
                },
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "deliveries_queued");
        assert_eq!(json["event"]["queued_count"], 2);
    }
}
