//! bfr-testkit
//!
//! Shared fixtures for scenario tests: a recording `WorkerBackend` that
//! captures every side effect of the consumer pipeline, a recording
//! delivery enqueuer, static webhook adapters, and a static token
//! verifier. No live service is touched anywhere in this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use bfr_daemon::{AuthUser, TokenVerifier};
use bfr_db::executions::{NewExecution, TerminalUpdate};
use bfr_events::{DeliveryEnqueuer, HandleResult, WebhookAdapter, WebhookRequest};
use bfr_pool::{CancelHandle, PoolError};
use bfr_schemas::{
    ExecutionContext, ExecutionStatus, OrganizationRef, PendingExecution, PoolOutcome,
    RendezvousResult, ResourceMetrics, WorkflowMetadata,
};
use bfr_worker::backend::{HistoryUpdate, WorkerBackend};

// ---------------------------------------------------------------------------
// RecordingBackend
// ---------------------------------------------------------------------------

/// What the pool should do when the pipeline reaches it.
#[derive(Debug, Clone)]
pub enum PoolBehavior {
    Outcome(PoolOutcome),
    Timeout(u32),
    Cancelled,
    RunnerError(String),
}

/// Every observable side effect of one pipeline run, in call order.
#[derive(Debug, Clone)]
pub enum Call {
    RemoveFromTracker(Uuid),
    CreateExecution {
        execution_id: Uuid,
        workflow_name: String,
        status: ExecutionStatus,
        org_id: Option<Uuid>,
    },
    UpdateExecution {
        execution_id: Uuid,
        status: ExecutionStatus,
        error_type: Option<String>,
        duration_ms: Option<i64>,
    },
    DeletePending(Uuid),
    PublishExecution {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
    PublishHistory {
        status: ExecutionStatus,
        workflow_name: String,
    },
    PushSyncResult {
        execution_id: Uuid,
        status: ExecutionStatus,
        error_type: Option<String>,
    },
    FlushLogs(Uuid),
    UpdateMetrics {
        status: ExecutionStatus,
        time_saved: i32,
        value: f64,
    },
    UpdateDelivery {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
    RunPool {
        execution_id: Uuid,
        timeout_seconds: u32,
    },
}

/// In-memory `WorkerBackend` recording the full call sequence.
#[derive(Default)]
pub struct RecordingBackend {
    pub pending: Mutex<HashMap<Uuid, PendingExecution>>,
    pub metadata: Mutex<HashMap<Uuid, WorkflowMetadata>>,
    pub code: Mutex<HashMap<Uuid, String>>,
    pub organizations: Mutex<HashMap<Uuid, OrganizationRef>>,
    pub scope_config: Mutex<Value>,
    pub pool_behavior: Mutex<Option<PoolBehavior>>,
    pub calls: Mutex<Vec<Call>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            scope_config: Mutex::new(Value::Object(Default::default())),
            ..Default::default()
        }
    }

    pub fn with_pending(self, execution_id: Uuid, pending: PendingExecution) -> Self {
        self.pending.lock().unwrap().insert(execution_id, pending);
        self
    }

    pub fn with_workflow(self, meta: WorkflowMetadata) -> Self {
        self.metadata.lock().unwrap().insert(meta.id, meta);
        self
    }

    pub fn with_pool(self, behavior: PoolBehavior) -> Self {
        *self.pool_behavior.lock().unwrap() = Some(behavior);
        self
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn recorded(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn terminal_updates(&self) -> Vec<(ExecutionStatus, Option<String>, Option<i64>)> {
        self.recorded()
            .into_iter()
            .filter_map(|c| match c {
                Call::UpdateExecution {
                    status,
                    error_type,
                    duration_ms,
                    ..
                } => Some((status, error_type, duration_ms)),
                _ => None,
            })
            .collect()
    }

    pub fn sync_pushes(&self) -> Vec<(ExecutionStatus, Option<String>)> {
        self.recorded()
            .into_iter()
            .filter_map(|c| match c {
                Call::PushSyncResult {
                    status, error_type, ..
                } => Some((status, error_type)),
                _ => None,
            })
            .collect()
    }

    pub fn pending_deletes(&self) -> usize {
        self.recorded()
            .iter()
            .filter(|c| matches!(c, Call::DeletePending(_)))
            .count()
    }

    pub fn created_rows(&self) -> Vec<(String, ExecutionStatus)> {
        self.recorded()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateExecution {
                    workflow_name,
                    status,
                    ..
                } => Some((workflow_name, status)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl WorkerBackend for RecordingBackend {
    async fn remove_from_queue_tracker(&self, execution_id: Uuid) {
        self.record(Call::RemoveFromTracker(execution_id));
    }

    async fn get_pending(&self, execution_id: Uuid) -> Result<Option<PendingExecution>> {
        Ok(self.pending.lock().unwrap().get(&execution_id).cloned())
    }

    async fn delete_pending(&self, execution_id: Uuid) {
        self.pending.lock().unwrap().remove(&execution_id);
        self.record(Call::DeletePending(execution_id));
    }

    async fn workflow_metadata(&self, workflow_id: Uuid) -> Result<Option<WorkflowMetadata>> {
        Ok(self.metadata.lock().unwrap().get(&workflow_id).cloned())
    }

    async fn workflow_code(&self, workflow_id: Uuid) -> Result<Option<String>> {
        Ok(self.code.lock().unwrap().get(&workflow_id).cloned())
    }

    async fn create_execution(&self, new: &NewExecution) -> Result<()> {
        self.record(Call::CreateExecution {
            execution_id: new.execution_id,
            workflow_name: new.workflow_name.clone(),
            status: new.status,
            org_id: new.org_id,
        });
        Ok(())
    }

    async fn update_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        update: &TerminalUpdate,
    ) -> Result<()> {
        self.record(Call::UpdateExecution {
            execution_id,
            status,
            error_type: update.error_type.clone(),
            duration_ms: update.duration_ms,
        });
        Ok(())
    }

    async fn load_organization(&self, org_id: Uuid) -> Result<Option<OrganizationRef>> {
        Ok(self.organizations.lock().unwrap().get(&org_id).cloned())
    }

    async fn load_scope_config(&self, _org_id: Option<Uuid>) -> Result<Value> {
        Ok(self.scope_config.lock().unwrap().clone())
    }

    async fn run_pool(
        &self,
        context: &ExecutionContext,
        timeout_seconds: u32,
        _cancel: CancelHandle,
    ) -> Result<PoolOutcome, PoolError> {
        self.record(Call::RunPool {
            execution_id: context.execution_id,
            timeout_seconds,
        });
        let behavior = self
            .pool_behavior
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(PoolBehavior::RunnerError("no pool behavior set".to_string()));
        match behavior {
            PoolBehavior::Outcome(outcome) => Ok(outcome),
            PoolBehavior::Timeout(seconds) => Err(PoolError::Timeout { seconds }),
            PoolBehavior::Cancelled => Err(PoolError::Cancelled),
            PoolBehavior::RunnerError(msg) => Err(PoolError::Runner(anyhow!(msg))),
        }
    }

    fn watch_cancellation(&self, _execution_id: Uuid) -> CancelHandle {
        CancelHandle::never()
    }

    async fn publish_execution_update(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        _data: Option<Value>,
    ) {
        self.record(Call::PublishExecution {
            execution_id,
            status,
        });
    }

    async fn publish_history_update(&self, update: HistoryUpdate) {
        self.record(Call::PublishHistory {
            status: update.status,
            workflow_name: update.workflow_name,
        });
    }

    async fn push_sync_result(
        &self,
        execution_id: Uuid,
        result: &RendezvousResult,
        _timeout_seconds: u64,
    ) {
        self.record(Call::PushSyncResult {
            execution_id,
            status: result.status,
            error_type: result.error_type.clone(),
        });
    }

    async fn flush_logs(&self, execution_id: Uuid) {
        self.record(Call::FlushLogs(execution_id));
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_metrics(
        &self,
        _execution_id: Uuid,
        _workflow_id: Option<Uuid>,
        _org_id: Option<Uuid>,
        status: ExecutionStatus,
        _duration_ms: i64,
        _metrics: Option<&ResourceMetrics>,
        time_saved: i32,
        value: f64,
    ) {
        self.record(Call::UpdateMetrics {
            status,
            time_saved,
            value,
        });
    }

    async fn update_delivery(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        _error_message: Option<&str>,
    ) {
        self.record(Call::UpdateDelivery {
            execution_id,
            status,
        });
    }
}

// ---------------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------------

pub fn make_pending(user_id: Uuid, org_id: Option<Uuid>) -> PendingExecution {
    PendingExecution {
        parameters: serde_json::json!({"x": "hi"}),
        user_id,
        user_name: "Test User".to_string(),
        user_email: "test@example.com".to_string(),
        org_id,
        form_id: None,
        api_key_id: None,
        startup: None,
        cancelled: false,
    }
}

pub fn make_workflow(id: Uuid, name: &str, timeout_seconds: u32) -> WorkflowMetadata {
    WorkflowMetadata {
        id,
        name: name.to_string(),
        function_name: Some(name.to_string()),
        file_path: Some(format!("flows/{name}.py")),
        timeout_seconds,
        time_saved: 5,
        value: 1.5,
        execution_mode: "async".to_string(),
        organization_id: None,
    }
}

pub fn success_outcome(result: Value, duration_ms: i64) -> PoolOutcome {
    PoolOutcome {
        status: "Success".to_string(),
        result: Some(result),
        error_message: None,
        error_type: None,
        duration_ms,
        variables: None,
        metrics: None,
        roi: None,
    }
}

// ---------------------------------------------------------------------------
// RecordingEnqueuer
// ---------------------------------------------------------------------------

/// Delivery enqueuer that hands out ids and records requests; can be set
/// to fail for specific workflows.
#[derive(Default)]
pub struct RecordingEnqueuer {
    pub enqueued: Mutex<Vec<(Uuid, Value, Option<Uuid>)>>,
    pub fail_for: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl DeliveryEnqueuer for RecordingEnqueuer {
    async fn enqueue_system_execution(
        &self,
        workflow_id: Uuid,
        parameters: Value,
        org_id_hint: Option<Uuid>,
    ) -> Result<Uuid> {
        if self.fail_for.lock().unwrap().contains(&workflow_id) {
            return Err(anyhow!("broker unavailable"));
        }
        let execution_id = Uuid::new_v4();
        self.enqueued
            .lock()
            .unwrap()
            .push((workflow_id, parameters, org_id_hint));
        Ok(execution_id)
    }
}

// ---------------------------------------------------------------------------
// StaticAdapter
// ---------------------------------------------------------------------------

/// Adapter that always answers with a preconfigured result.
pub struct StaticAdapter {
    pub result: HandleResult,
}

#[async_trait]
impl WebhookAdapter for StaticAdapter {
    async fn handle_request(
        &self,
        _request: &WebhookRequest,
        _config: &Value,
        _state: &mut Value,
    ) -> Result<HandleResult> {
        Ok(self.result.clone())
    }
}

// ---------------------------------------------------------------------------
// StaticVerifier
// ---------------------------------------------------------------------------

/// Token verifier backed by a fixed token → user map.
#[derive(Default)]
pub struct StaticVerifier {
    users: HashMap<String, AuthUser>,
}

impl StaticVerifier {
    pub fn with_user(mut self, token: &str, user_id: Uuid, is_admin: bool) -> Self {
        self.users.insert(
            token.to_string(),
            AuthUser {
                user_id,
                name: "Test User".to_string(),
                email: "test@example.com".to_string(),
                is_admin,
            },
        );
        self
    }
}

impl TokenVerifier for StaticVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        self.users.get(token).cloned()
    }
}
