//! Execution context and outcome types.
//!
//! `PendingExecution` is the reservation written by intake into Redis;
//! `ExecutionContext` is the full document the worker assembles and hands to
//! the subprocess runner; `PoolOutcome` is what comes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PendingExecution
// ---------------------------------------------------------------------------

/// The in-flight reservation stored at `bifrost:pending:<id>` between
/// intake and worker claim. Deleted on every terminal path; a missing
/// record on claim means the message was already reaped or replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingExecution {
    pub parameters: Value,
    pub user_id: Uuid,
    pub user_name: String,
    pub user_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<Uuid>,
    /// Launch-workflow results made available to the run as startup data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<Value>,
    /// Cancellation intent set between enqueue and claim; the worker
    /// honours it before spawning anything.
    #[serde(default)]
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Identity of the caller on whose behalf the run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
}

/// Organization scope carried into the run (None = global scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationRef {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

/// ROI defaults/result for one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RoiData {
    /// Minutes of human time this run is credited with saving.
    #[serde(default)]
    pub time_saved: i32,
    #[serde(default)]
    pub value: f64,
}

/// The full document handed to the subprocess runner on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    /// Display name (workflow name or script name).
    pub name: String,
    /// Entry-point function resolved from the workflow record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Code blob from the workflow record, when stored in the DB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_code: Option<String>,
    /// Base64-encoded inline script (distinct from `workflow_code`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub parameters: Value,
    pub caller: Caller,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<OrganizationRef>,
    /// Resolved config map for the run's scope (org overlaid on global).
    pub config: Value,
    pub tags: Vec<String>,
    pub timeout_seconds: u32,
    /// Transient runs leave no durable receipt (data providers).
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub is_platform_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<Value>,
    #[serde(default)]
    pub roi: RoiData,
    /// Source path under the workspace; the runner injects it so user code
    /// using paths relative to its own file keeps working.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

// ---------------------------------------------------------------------------
// PoolOutcome
// ---------------------------------------------------------------------------

/// Resource usage self-reported by the runner.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_user_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_system_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_total_seconds: Option<f64>,
}

/// The single outcome document the runner prints to stdout.
///
/// `status` is a free string here ("Success", "Failed", …) and is mapped
/// leniently to `ExecutionStatus` at the worker — the runner binary is a
/// separate program and its output is not trusted to be well-formed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOutcome {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub duration_ms: i64,
    /// Runtime variables snapshot (admin-only surface).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi: Option<RoiData>,
}

// ---------------------------------------------------------------------------
// WorkflowMetadata
// ---------------------------------------------------------------------------

/// The slice of a workflow record the hot path needs; this is what the
/// Redis metadata cache stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub timeout_seconds: u32,
    pub time_saved: i32,
    pub value: f64,
    /// "sync" | "async"
    pub execution_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
}

impl WorkflowMetadata {
    pub fn is_sync(&self) -> bool {
        self.execution_mode == "sync"
    }
}
