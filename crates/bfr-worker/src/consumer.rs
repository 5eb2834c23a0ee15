//! The workflow-execution consumer pipeline.
//!
//! Redis-first architecture:
//!   1. intake stores the pending context in Redis and publishes the queue
//!      message;
//!   2. the worker reads the pending context on claim;
//!   3. the worker creates the Postgres record when starting;
//!   4. the worker runs the pool and applies the one terminal update;
//!   5. the worker deletes the Redis pending entry.
//!
//! For sync requests the worker pushes exactly one result payload to the
//! rendezvous list on every terminal path — success, failure, timeout,
//! cancellation, and pending-missing alike.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use bfr_db::executions::{NewExecution, TerminalUpdate};
use bfr_pool::PoolError;
use bfr_schemas::{
    Caller, ExecutionContext, ExecutionQueueMessage, ExecutionStatus, PendingExecution,
    RendezvousResult, RoiData, WORKFLOW_EXECUTIONS_QUEUE,
};

use crate::backend::{HistoryUpdate, WorkerBackend};

/// Default timeout when no workflow metadata is available (inline scripts).
const DEFAULT_TIMEOUT_SECONDS: u32 = 1800;

pub struct WorkflowExecutionConsumer {
    backend: Arc<dyn WorkerBackend>,
    prefetch: u16,
}

impl WorkflowExecutionConsumer {
    pub fn new(backend: Arc<dyn WorkerBackend>, prefetch: u16) -> Self {
        Self { backend, prefetch }
    }
}

#[async_trait]
impl bfr_queue::QueueConsumer for WorkflowExecutionConsumer {
    fn queue_name(&self) -> &str {
        WORKFLOW_EXECUTIONS_QUEUE
    }

    fn prefetch(&self) -> u16 {
        self.prefetch
    }

    async fn handle(&self, body: Value) -> Result<()> {
        let message: ExecutionQueueMessage = serde_json::from_value(body)?;
        process_execution_message(self.backend.as_ref(), &message).await
    }
}

/// Run the full pipeline for one message. An `Err` return means the
/// delivery is dead-lettered — the outer catch has already written the
/// `Failed(InternalError)` row before re-raising.
pub async fn process_execution_message(
    backend: &dyn WorkerBackend,
    message: &ExecutionQueueMessage,
) -> Result<()> {
    let execution_id = message.execution_id;
    let start_time = Utc::now();

    // Step 1: the execution is no longer "queued".
    backend.remove_from_queue_tracker(execution_id).await;

    // Step 2: claim the pending context.
    let Some(pending) = backend.get_pending(execution_id).await? else {
        error!(%execution_id, "no pending execution found in Redis");
        if message.sync {
            backend
                .push_sync_result(
                    execution_id,
                    &RendezvousResult {
                        status: ExecutionStatus::Failed,
                        result: None,
                        error: Some("Pending execution not found".to_string()),
                        error_type: Some("PendingNotFound".to_string()),
                        duration_ms: 0,
                    },
                    u64::from(DEFAULT_TIMEOUT_SECONDS),
                )
                .await;
        }
        // Reaped or replayed message: no DB row is created.
        return Ok(());
    };

    let ctx = PipelineCtx {
        backend,
        message,
        pending: &pending,
        start_time,
    };

    match ctx.run().await {
        Ok(()) => Ok(()),
        Err(err) => {
            ctx.internal_error(&err).await;
            Err(err)
        }
    }
}

struct PipelineCtx<'a> {
    backend: &'a dyn WorkerBackend,
    message: &'a ExecutionQueueMessage,
    pending: &'a PendingExecution,
    start_time: DateTime<Utc>,
}

impl<'a> PipelineCtx<'a> {
    fn execution_id(&self) -> Uuid {
        self.message.execution_id
    }

    fn display_name(&self) -> String {
        self.message
            .script_name
            .clone()
            .unwrap_or_else(|| "workflow".to_string())
    }

    fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.start_time).num_milliseconds()
    }

    async fn run(&self) -> Result<()> {
        let execution_id = self.execution_id();
        let is_script = self.message.is_script();

        info!(
            %execution_id,
            workflow_id = ?self.message.workflow_id,
            script = is_script,
            "processing execution"
        );

        // Step 3: cancellation between enqueue and claim.
        if self.pending.cancelled {
            info!(%execution_id, "execution was cancelled before starting");
            return self.cancelled_before_start().await;
        }

        // Step 4: workflow resolution.
        let mut workflow_name = self
            .message
            .script_name
            .clone()
            .unwrap_or_else(|| "inline_script".to_string());
        let mut timeout_seconds = DEFAULT_TIMEOUT_SECONDS;
        let mut roi = RoiData::default();
        let mut org_id = self.pending.org_id;
        let mut function_name = None;
        let mut file_path = None;
        let mut workflow_code = None;

        if !is_script {
            let Some(workflow_id) = self.message.workflow_id else {
                return Err(anyhow!("message carries neither workflow_id nor code"));
            };

            let Some(meta) = self.backend.workflow_metadata(workflow_id).await? else {
                return self.workflow_not_found(workflow_id).await;
            };

            workflow_name = meta.name.clone();
            function_name = meta.function_name.clone();
            file_path = meta.file_path.clone();
            timeout_seconds = meta.timeout_seconds;
            roi = RoiData {
                time_saved: meta.time_saved,
                value: meta.value,
            };
            workflow_code = self.backend.workflow_code(workflow_id).await?;

            // System-triggered runs (schedules, webhooks) carry no caller
            // org; adopt the workflow's scope so SDK operations resolve.
            if org_id.is_none() {
                if let Some(workflow_org) = meta.organization_id {
                    info!(%execution_id, %workflow_org, "using workflow org fallback");
                    org_id = Some(workflow_org);
                }
            }
        }

        // Step 5: durable Running row + transition broadcasts.
        self.backend
            .create_execution(&NewExecution {
                execution_id,
                workflow_name: workflow_name.clone(),
                parameters: self.pending.parameters.clone(),
                org_id,
                user_id: self.pending.user_id,
                user_name: self.pending.user_name.clone(),
                form_id: self.pending.form_id,
                api_key_id: self.pending.api_key_id,
                status: ExecutionStatus::Running,
            })
            .await?;
        self.backend
            .publish_execution_update(execution_id, ExecutionStatus::Running, None)
            .await;
        self.publish_history(ExecutionStatus::Running, &workflow_name, org_id, None, None)
            .await;

        // Step 6: organization + scoped config.
        let organization = match org_id {
            Some(id) => self.backend.load_organization(id).await?,
            None => None,
        };
        let config = self.backend.load_scope_config(org_id).await?;

        // Step 7: the isolated run.
        let context = ExecutionContext {
            execution_id,
            workflow_id: self.message.workflow_id,
            name: workflow_name.clone(),
            function_name,
            workflow_code,
            code: self.message.code.clone(),
            parameters: self.pending.parameters.clone(),
            caller: Caller {
                user_id: self.pending.user_id,
                email: self.pending.user_email.clone(),
                name: self.pending.user_name.clone(),
            },
            organization,
            config,
            tags: if is_script {
                Vec::new()
            } else {
                vec!["workflow".to_string()]
            },
            timeout_seconds,
            transient: false,
            is_platform_admin: false,
            startup: self.pending.startup.clone(),
            roi,
            file_path,
        };

        let cancel = self.backend.watch_cancellation(execution_id);
        let outcome = match self.backend.run_pool(&context, timeout_seconds, cancel).await {
            Ok(outcome) => outcome,
            Err(PoolError::Cancelled) => {
                return self
                    .pool_terminal(
                        ExecutionStatus::Cancelled,
                        "Execution cancelled by user",
                        None,
                        &workflow_name,
                        org_id,
                        timeout_seconds,
                    )
                    .await;
            }
            Err(err @ PoolError::Timeout { .. }) => {
                return self
                    .pool_terminal(
                        ExecutionStatus::Timeout,
                        &err.to_string(),
                        Some("TimeoutError"),
                        &workflow_name,
                        org_id,
                        timeout_seconds,
                    )
                    .await;
            }
            Err(PoolError::Runner(err)) => return Err(err),
        };

        // Step 8: map the outcome onto the one terminal update.
        let status = ExecutionStatus::parse_lenient(&outcome.status);
        let final_roi = outcome.roi.unwrap_or(roi);
        let duration_ms = outcome.duration_ms;

        self.backend
            .update_execution(
                execution_id,
                status,
                &TerminalUpdate {
                    result: outcome.result.clone(),
                    error_message: outcome.error_message.clone(),
                    error_type: outcome.error_type.clone(),
                    duration_ms: Some(duration_ms),
                    variables: outcome.variables.clone(),
                    metrics: outcome.metrics,
                    time_saved: Some(final_roi.time_saved),
                    value: Some(final_roi.value),
                },
            )
            .await?;

        self.backend
            .publish_execution_update(
                execution_id,
                status,
                Some(json!({
                    "result": outcome.result,
                    "durationMs": duration_ms,
                })),
            )
            .await;
        let completed_at = Utc::now();
        self.publish_history(
            status,
            &workflow_name,
            org_id,
            Some(completed_at),
            Some(duration_ms),
        )
        .await;

        // Logs live in the Redis stream; mirror them now that the run is
        // terminal.
        self.backend.flush_logs(execution_id).await;
        self.backend.delete_pending(execution_id).await;

        if self.message.sync {
            self.backend
                .push_sync_result(
                    execution_id,
                    &RendezvousResult {
                        status,
                        result: outcome.result.clone(),
                        error: outcome.error_message.clone(),
                        error_type: outcome.error_type.clone(),
                        duration_ms,
                    },
                    u64::from(timeout_seconds),
                )
                .await;
        }

        // Step 10: aggregates + event back-propagation.
        self.backend
            .update_metrics(
                execution_id,
                self.message.workflow_id,
                org_id,
                status,
                duration_ms,
                outcome.metrics.as_ref(),
                final_roi.time_saved,
                final_roi.value,
            )
            .await;
        self.backend
            .update_delivery(execution_id, status, outcome.error_message.as_deref())
            .await;

        info!(
            %execution_id,
            workflow = %workflow_name,
            status = %status,
            duration_ms,
            "execution completed"
        );
        Ok(())
    }

    /// Step 3 terminal: cancelled before any subprocess was spawned.
    async fn cancelled_before_start(&self) -> Result<()> {
        let execution_id = self.execution_id();
        let name = self.display_name();
        const CANCEL_MSG: &str = "Execution was cancelled before it could start";

        self.backend
            .create_execution(&NewExecution {
                execution_id,
                workflow_name: name.clone(),
                parameters: self.pending.parameters.clone(),
                org_id: self.pending.org_id,
                user_id: self.pending.user_id,
                user_name: self.pending.user_name.clone(),
                form_id: self.pending.form_id,
                api_key_id: self.pending.api_key_id,
                status: ExecutionStatus::Cancelled,
            })
            .await?;
        self.backend
            .update_execution(
                execution_id,
                ExecutionStatus::Cancelled,
                &TerminalUpdate {
                    error_message: Some(CANCEL_MSG.to_string()),
                    duration_ms: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        self.backend
            .publish_execution_update(execution_id, ExecutionStatus::Cancelled, None)
            .await;
        self.publish_history(
            ExecutionStatus::Cancelled,
            &name,
            self.pending.org_id,
            None,
            Some(0),
        )
        .await;
        self.backend.delete_pending(execution_id).await;

        if self.message.sync {
            self.backend
                .push_sync_result(
                    execution_id,
                    &RendezvousResult {
                        status: ExecutionStatus::Cancelled,
                        result: None,
                        error: Some(CANCEL_MSG.to_string()),
                        error_type: None,
                        duration_ms: 0,
                    },
                    u64::from(DEFAULT_TIMEOUT_SECONDS),
                )
                .await;
        }
        Ok(())
    }

    /// Step 4 terminal: the workflow id resolves to nothing.
    async fn workflow_not_found(&self, workflow_id: Uuid) -> Result<()> {
        let execution_id = self.execution_id();
        error!(%execution_id, %workflow_id, "workflow not found");
        let error_msg = format!("Workflow with ID '{workflow_id}' not found");
        let duration_ms = self.elapsed_ms();

        self.backend
            .create_execution(&NewExecution {
                execution_id,
                workflow_name: "unknown".to_string(),
                parameters: self.pending.parameters.clone(),
                org_id: self.pending.org_id,
                user_id: self.pending.user_id,
                user_name: self.pending.user_name.clone(),
                form_id: self.pending.form_id,
                api_key_id: self.pending.api_key_id,
                status: ExecutionStatus::Failed,
            })
            .await?;
        self.backend
            .update_execution(
                execution_id,
                ExecutionStatus::Failed,
                &TerminalUpdate {
                    result: Some(json!({"error": "WorkflowNotFound", "message": error_msg})),
                    error_message: Some(error_msg.clone()),
                    error_type: Some("WorkflowNotFound".to_string()),
                    duration_ms: Some(duration_ms),
                    ..Default::default()
                },
            )
            .await?;

        self.backend
            .publish_execution_update(
                execution_id,
                ExecutionStatus::Failed,
                Some(json!({"error": error_msg})),
            )
            .await;
        self.publish_history(
            ExecutionStatus::Failed,
            "unknown",
            self.pending.org_id,
            Some(Utc::now()),
            Some(duration_ms),
        )
        .await;
        self.backend.delete_pending(execution_id).await;

        if self.message.sync {
            self.backend
                .push_sync_result(
                    execution_id,
                    &RendezvousResult {
                        status: ExecutionStatus::Failed,
                        result: None,
                        error: Some(error_msg),
                        error_type: Some("WorkflowNotFound".to_string()),
                        duration_ms,
                    },
                    u64::from(DEFAULT_TIMEOUT_SECONDS),
                )
                .await;
        }
        Ok(())
    }

    /// Terminal path for pool-level timeout/cancellation after the Running
    /// row exists.
    async fn pool_terminal(
        &self,
        status: ExecutionStatus,
        error_msg: &str,
        error_type: Option<&str>,
        workflow_name: &str,
        org_id: Option<Uuid>,
        timeout_seconds: u32,
    ) -> Result<()> {
        let execution_id = self.execution_id();
        let duration_ms = self.elapsed_ms();

        self.backend
            .update_execution(
                execution_id,
                status,
                &TerminalUpdate {
                    error_message: Some(error_msg.to_string()),
                    error_type: error_type.map(str::to_string),
                    duration_ms: Some(duration_ms),
                    ..Default::default()
                },
            )
            .await?;

        self.backend
            .publish_execution_update(execution_id, status, None)
            .await;
        self.publish_history(
            status,
            workflow_name,
            org_id,
            Some(Utc::now()),
            Some(duration_ms),
        )
        .await;

        self.backend.flush_logs(execution_id).await;
        self.backend.delete_pending(execution_id).await;

        if self.message.sync {
            self.backend
                .push_sync_result(
                    execution_id,
                    &RendezvousResult {
                        status,
                        result: None,
                        error: Some(error_msg.to_string()),
                        error_type: error_type.map(str::to_string),
                        duration_ms,
                    },
                    u64::from(timeout_seconds),
                )
                .await;
        }
        Ok(())
    }

    /// Step 9, the outer catch: anything that escaped the per-path handlers
    /// writes a `Failed(InternalError)` row, cleans up, and lets the caller
    /// re-raise so the delivery dead-letters.
    async fn internal_error(&self, err: &anyhow::Error) {
        let execution_id = self.execution_id();
        let duration_ms = self.elapsed_ms();
        error!(%execution_id, error = ?err, "workflow execution error");

        if let Err(db_err) = self
            .backend
            .update_execution(
                execution_id,
                ExecutionStatus::Failed,
                &TerminalUpdate {
                    error_message: Some(err.to_string()),
                    error_type: Some("InternalError".to_string()),
                    duration_ms: Some(duration_ms),
                    ..Default::default()
                },
            )
            .await
        {
            error!(%execution_id, error = ?db_err, "failed to record internal error");
        }

        self.backend
            .publish_execution_update(
                execution_id,
                ExecutionStatus::Failed,
                Some(json!({"error": err.to_string(), "errorType": "InternalError"})),
            )
            .await;
        self.publish_history(
            ExecutionStatus::Failed,
            &self.display_name(),
            self.pending.org_id,
            Some(Utc::now()),
            Some(duration_ms),
        )
        .await;
        self.backend.delete_pending(execution_id).await;

        if self.message.sync {
            self.backend
                .push_sync_result(
                    execution_id,
                    &RendezvousResult {
                        status: ExecutionStatus::Failed,
                        result: None,
                        error: Some(err.to_string()),
                        error_type: Some("InternalError".to_string()),
                        duration_ms,
                    },
                    u64::from(DEFAULT_TIMEOUT_SECONDS),
                )
                .await;
        }
    }

    async fn publish_history(
        &self,
        status: ExecutionStatus,
        workflow_name: &str,
        org_id: Option<Uuid>,
        completed_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
    ) {
        self.backend
            .publish_history_update(HistoryUpdate {
                execution_id: self.execution_id(),
                status,
                workflow_name: workflow_name.to_string(),
                executed_by: self.pending.user_id,
                executed_by_name: self.pending.user_name.clone(),
                org_id,
                started_at: Some(self.start_time),
                completed_at,
                duration_ms,
            })
            .await;
    }
}
