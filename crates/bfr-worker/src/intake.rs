//! Execution intake.
//!
//! Writes the Redis reservation first, then publishes the minimal queue
//! message — the worker finds everything else under the execution id. The
//! intake writes only Redis; the DB row belongs to the worker that claims
//! the message.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use bfr_cache::rendezvous::RENDEZVOUS_MARGIN_SECS;
use bfr_cache::CacheClient;
use bfr_queue::AmqpPools;
use bfr_schemas::{
    ExecutionQueueMessage, ExecutionStatus, PendingExecution, WORKFLOW_EXECUTIONS_QUEUE,
};

use crate::metadata::get_workflow_metadata;

/// System identity used for schedule- and event-triggered executions.
pub const SYSTEM_USER_ID: Uuid = Uuid::nil();

/// The intake-side view of an execution request's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecutionResponse {
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Identity fields for one enqueue request.
#[derive(Debug, Clone)]
pub struct IntakeCaller {
    pub user_id: Uuid,
    pub user_name: String,
    pub user_email: String,
    pub org_id: Option<Uuid>,
}

impl IntakeCaller {
    pub fn system(source: &str) -> Self {
        Self {
            user_id: SYSTEM_USER_ID,
            user_name: source.to_string(),
            user_email: String::new(),
            org_id: None,
        }
    }
}

#[derive(Clone)]
pub struct Intake {
    pool: PgPool,
    cache: CacheClient,
    amqp: AmqpPools,
}

impl Intake {
    pub fn new(pool: PgPool, cache: CacheClient, amqp: AmqpPools) -> Self {
        Self { pool, cache, amqp }
    }

    /// Run a workflow by id. The `sync` flag (explicit, or implied by the
    /// workflow's `execution_mode`) decides whether this blocks on the
    /// rendezvous or returns `Pending` immediately.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_workflow(
        &self,
        caller: &IntakeCaller,
        workflow_id: Uuid,
        parameters: Value,
        form_id: Option<Uuid>,
        api_key_id: Option<Uuid>,
        startup: Option<Value>,
        sync: bool,
    ) -> Result<WorkflowExecutionResponse> {
        let meta = get_workflow_metadata(&self.cache, &self.pool, workflow_id)
            .await?
            .ok_or_else(|| anyhow!("Workflow with ID '{workflow_id}' not found"))?;

        let use_sync = sync || meta.is_sync();

        let execution_id = self
            .enqueue(
                caller,
                ExecutionQueueMessage::for_workflow(Uuid::new_v4(), workflow_id, use_sync),
                parameters,
                form_id,
                api_key_id,
                startup,
            )
            .await?;

        if !use_sync {
            return Ok(WorkflowExecutionResponse {
                execution_id,
                workflow_id: Some(workflow_id),
                workflow_name: meta.name,
                status: ExecutionStatus::Pending,
                result: None,
                error: None,
                error_type: None,
                duration_ms: None,
            });
        }

        // Sync rendezvous. A timeout here does not cancel the work; the
        // execution continues and persists its real outcome.
        let wait = u64::from(meta.timeout_seconds) + RENDEZVOUS_MARGIN_SECS;
        match self.cache.wait_for_result(execution_id, wait).await? {
            Some(result) => Ok(WorkflowExecutionResponse {
                execution_id,
                workflow_id: Some(workflow_id),
                workflow_name: meta.name,
                status: result.status,
                result: result.result,
                error: result.error,
                error_type: result.error_type,
                duration_ms: Some(result.duration_ms),
            }),
            None => Ok(WorkflowExecutionResponse {
                execution_id,
                workflow_id: Some(workflow_id),
                workflow_name: meta.name,
                status: ExecutionStatus::Timeout,
                result: None,
                error: Some("Execution timed out waiting for result".to_string()),
                error_type: Some("TimeoutError".to_string()),
                duration_ms: None,
            }),
        }
    }

    /// Enqueue inline code. Scripts always run async.
    pub async fn run_code(
        &self,
        caller: &IntakeCaller,
        code: &str,
        script_name: &str,
        parameters: Value,
    ) -> Result<WorkflowExecutionResponse> {
        let message = ExecutionQueueMessage::for_script(
            Uuid::new_v4(),
            BASE64.encode(code.as_bytes()),
            script_name.to_string(),
        );
        let execution_id = self
            .enqueue(caller, message, parameters, None, None, None)
            .await?;
        Ok(WorkflowExecutionResponse {
            execution_id,
            workflow_id: None,
            workflow_name: script_name.to_string(),
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            error_type: None,
            duration_ms: None,
        })
    }

    /// The system-execution helper used by schedules and event deliveries.
    /// Org scope comes from the workflow unless the caller supplies one.
    pub async fn enqueue_system_workflow_execution(
        &self,
        workflow_id: Uuid,
        parameters: Value,
        source: &str,
        org_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let mut caller = IntakeCaller::system(source);
        caller.org_id = match org_id {
            Some(id) => Some(id),
            None => get_workflow_metadata(&self.cache, &self.pool, workflow_id)
                .await?
                .and_then(|m| m.organization_id),
        };
        self.enqueue(
            &caller,
            ExecutionQueueMessage::for_workflow(Uuid::new_v4(), workflow_id, false),
            parameters,
            None,
            None,
            None,
        )
        .await
    }

    /// Cancellation intent: flips the pending bit (pre-claim) and the DB
    /// row to `Cancelling` (post-claim best-effort).
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool> {
        let pending_flagged = self.cache.mark_cancelled(execution_id).await?;
        let row_flagged = bfr_db::executions::mark_cancelling(&self.pool, execution_id).await?;
        if row_flagged {
            let _ = self
                .cache
                .publish(
                    &bfr_schemas::channels::execution(execution_id),
                    &bfr_schemas::BusMessage::ExecutionUpdate {
                        execution_id,
                        status: ExecutionStatus::Cancelling.as_str().to_string(),
                        data: None,
                    },
                )
                .await;
        }
        Ok(pending_flagged || row_flagged)
    }

    /// The common enqueue path: Redis reservation, queue tracker, broker
    /// message — in that order, so a claimed message always finds its
    /// context.
    async fn enqueue(
        &self,
        caller: &IntakeCaller,
        message: ExecutionQueueMessage,
        parameters: Value,
        form_id: Option<Uuid>,
        api_key_id: Option<Uuid>,
        startup: Option<Value>,
    ) -> Result<Uuid> {
        let execution_id = message.execution_id;

        let pending = PendingExecution {
            parameters,
            user_id: caller.user_id,
            user_name: caller.user_name.clone(),
            user_email: caller.user_email.clone(),
            org_id: caller.org_id,
            form_id,
            api_key_id,
            startup,
            cancelled: false,
        };
        self.cache
            .set_pending_execution(execution_id, &pending)
            .await
            .context("failed to store pending execution")?;

        if let Err(err) = self.cache.add_to_queue_tracker(execution_id).await {
            warn!(%execution_id, error = ?err, "queue tracker add failed");
        }

        bfr_queue::publish_message(&self.amqp, WORKFLOW_EXECUTIONS_QUEUE, &message, 0)
            .await
            .context("failed to publish execution message")?;

        info!(
            %execution_id,
            workflow_id = ?message.workflow_id,
            sync = message.sync,
            "execution enqueued"
        );
        Ok(execution_id)
    }
}

/// `DeliveryEnqueuer` implementation backed by the intake layer.
pub struct SystemEnqueuer {
    intake: Intake,
    source: String,
}

impl SystemEnqueuer {
    pub fn new(intake: Intake, source: &str) -> Self {
        Self {
            intake,
            source: source.to_string(),
        }
    }
}

#[async_trait]
impl bfr_events::DeliveryEnqueuer for SystemEnqueuer {
    async fn enqueue_system_execution(
        &self,
        workflow_id: Uuid,
        parameters: Value,
        org_id_hint: Option<Uuid>,
    ) -> Result<Uuid> {
        self.intake
            .enqueue_system_workflow_execution(workflow_id, parameters, &self.source, org_id_hint)
            .await
    }
}
