//! Queue message and rendezvous payload shapes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::ExecutionStatus;

/// Primary competing-consumer queue for workflow executions.
pub const WORKFLOW_EXECUTIONS_QUEUE: &str = "workflow-executions";

/// The message published to the workflow-executions queue.
///
/// Deliberately minimal: the full execution context lives in the Redis
/// pending record under `execution_id`. Exactly one of `workflow_id` or
/// `code` is set — `code` carries a base64-encoded inline script with
/// `script_name` for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQueueMessage {
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    /// When true the worker must push exactly one terminal payload to the
    /// rendezvous list, on every terminal path.
    #[serde(default)]
    pub sync: bool,
}

impl ExecutionQueueMessage {
    pub fn for_workflow(execution_id: Uuid, workflow_id: Uuid, sync: bool) -> Self {
        Self {
            execution_id,
            workflow_id: Some(workflow_id),
            code: None,
            script_name: None,
            sync,
        }
    }

    pub fn for_script(execution_id: Uuid, code_base64: String, script_name: String) -> Self {
        Self {
            execution_id,
            workflow_id: None,
            code: Some(code_base64),
            script_name: Some(script_name),
            sync: false,
        }
    }

    pub fn is_script(&self) -> bool {
        self.code.is_some()
    }
}

/// The single payload pushed to `bifrost:result:<id>` for sync callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousResult {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_minimal_shape() {
        let msg = ExecutionQueueMessage::for_workflow(Uuid::new_v4(), Uuid::new_v4(), true);
        let json = serde_json::to_string(&msg).unwrap();
        // Script fields absent on the wire for workflow messages.
        assert!(!json.contains("script_name"));
        let back: ExecutionQueueMessage = serde_json::from_str(&json).unwrap();
        assert!(back.sync);
        assert!(!back.is_script());
    }

    #[test]
    fn sync_defaults_to_false() {
        let msg: ExecutionQueueMessage =
            serde_json::from_str(&format!(r#"{{"execution_id":"{}"}}"#, Uuid::nil())).unwrap();
        assert!(!msg.sync);
    }
}
