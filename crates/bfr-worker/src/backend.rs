//! The worker's side-effect boundary.
//!
//! `WorkerBackend` is the behavioral contract the pipeline runs against:
//! durable writes (Postgres), cache operations (Redis), pub/sub publishes,
//! the execution pool, and the event back-propagation hook. Operations that
//! must never block a terminal write (cache deletes, publishes, sync
//! pushes, metrics) swallow their errors here with a warning — the DB row
//! is the durable truth.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use bfr_cache::CacheClient;
use bfr_db::{executions, logs, metrics};
use bfr_pool::{CancelHandle, ExecutionPool, PoolError};
use bfr_schemas::{
    channels, BusMessage, ExecutionContext, ExecutionStatus, OrganizationRef, PendingExecution,
    PoolOutcome, RendezvousResult, ResourceMetrics, WorkflowMetadata,
};

/// Interval at which an in-flight run re-checks its pending record for the
/// cancellation bit.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Fields of a history broadcast the pipeline supplies.
#[derive(Debug, Clone)]
pub struct HistoryUpdate {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub workflow_name: String,
    pub executed_by: Uuid,
    pub executed_by_name: String,
    pub org_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    // --- cache -----------------------------------------------------------

    /// Observational; absence is fine, failure is a warning.
    async fn remove_from_queue_tracker(&self, execution_id: Uuid);

    async fn get_pending(&self, execution_id: Uuid) -> Result<Option<PendingExecution>>;

    /// Best-effort: failures warn and continue.
    async fn delete_pending(&self, execution_id: Uuid);

    // --- workflow resolution --------------------------------------------

    async fn workflow_metadata(&self, workflow_id: Uuid) -> Result<Option<WorkflowMetadata>>;

    async fn workflow_code(&self, workflow_id: Uuid) -> Result<Option<String>>;

    // --- durable writes --------------------------------------------------

    async fn create_execution(&self, new: &executions::NewExecution) -> Result<()>;

    async fn update_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        update: &executions::TerminalUpdate,
    ) -> Result<()>;

    // --- scope resolution ------------------------------------------------

    async fn load_organization(&self, org_id: Uuid) -> Result<Option<OrganizationRef>>;

    async fn load_scope_config(&self, org_id: Option<Uuid>) -> Result<Value>;

    // --- pool ------------------------------------------------------------

    async fn run_pool(
        &self,
        context: &ExecutionContext,
        timeout_seconds: u32,
        cancel: CancelHandle,
    ) -> Result<PoolOutcome, PoolError>;

    /// A cancel handle that fires when the pending record's cancelled bit
    /// flips while the run is in flight.
    fn watch_cancellation(&self, execution_id: Uuid) -> CancelHandle;

    // --- fan-out (all best-effort) --------------------------------------

    async fn publish_execution_update(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        data: Option<Value>,
    );

    async fn publish_history_update(&self, update: HistoryUpdate);

    /// The one rendezvous push for a sync execution.
    async fn push_sync_result(
        &self,
        execution_id: Uuid,
        result: &RendezvousResult,
        timeout_seconds: u64,
    );

    /// Drain the Redis log stream into the durable table.
    async fn flush_logs(&self, execution_id: Uuid);

    async fn update_metrics(
        &self,
        execution_id: Uuid,
        workflow_id: Option<Uuid>,
        org_id: Option<Uuid>,
        status: ExecutionStatus,
        duration_ms: i64,
        metrics: Option<&ResourceMetrics>,
        time_saved: i32,
        value: f64,
    );

    /// Event back-propagation hook; no-op for non-event executions.
    async fn update_delivery(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error_message: Option<&str>,
    );
}

// ---------------------------------------------------------------------------
// ProductionBackend
// ---------------------------------------------------------------------------

pub struct ProductionBackend {
    pool: PgPool,
    cache: CacheClient,
    exec_pool: ExecutionPool,
}

impl ProductionBackend {
    pub fn new(pool: PgPool, cache: CacheClient, exec_pool: ExecutionPool) -> Self {
        Self {
            pool,
            cache,
            exec_pool,
        }
    }
}

#[async_trait]
impl WorkerBackend for ProductionBackend {
    async fn remove_from_queue_tracker(&self, execution_id: Uuid) {
        if let Err(err) = self.cache.remove_from_queue_tracker(execution_id).await {
            warn!(%execution_id, error = ?err, "queue tracker removal failed");
        }
    }

    async fn get_pending(&self, execution_id: Uuid) -> Result<Option<PendingExecution>> {
        self.cache.get_pending_execution(execution_id).await
    }

    async fn delete_pending(&self, execution_id: Uuid) {
        if let Err(err) = self.cache.delete_pending_execution(execution_id).await {
            warn!(%execution_id, error = ?err, "pending delete failed");
        }
    }

    async fn workflow_metadata(&self, workflow_id: Uuid) -> Result<Option<WorkflowMetadata>> {
        crate::metadata::get_workflow_metadata(&self.cache, &self.pool, workflow_id).await
    }

    async fn workflow_code(&self, workflow_id: Uuid) -> Result<Option<String>> {
        bfr_db::workflows::fetch_workflow_code(&self.pool, workflow_id).await
    }

    async fn create_execution(&self, new: &executions::NewExecution) -> Result<()> {
        executions::create_execution(&self.pool, new).await
    }

    async fn update_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        update: &executions::TerminalUpdate,
    ) -> Result<()> {
        executions::update_execution(&self.pool, execution_id, status, update).await
    }

    async fn load_organization(&self, org_id: Uuid) -> Result<Option<OrganizationRef>> {
        bfr_db::orgs::fetch_organization(&self.pool, org_id).await
    }

    async fn load_scope_config(&self, org_id: Option<Uuid>) -> Result<Value> {
        let global = bfr_db::orgs::fetch_scope_config(&self.pool, bfr_config::GLOBAL_SCOPE).await?;
        let org = match org_id {
            Some(id) => Some(bfr_db::orgs::fetch_scope_config(&self.pool, &id.to_string()).await?),
            None => None,
        };
        let mut config = bfr_config::resolve_scope_config(global, org);

        // Integration bindings ride along so user code can reach its
        // connected systems without a DB round-trip from inside the run.
        let mappings = bfr_db::orgs::list_integration_mappings(&self.pool, org_id).await?;
        if !mappings.is_empty() {
            let mut integrations = serde_json::Map::new();
            for m in mappings {
                integrations.insert(
                    m.integration,
                    serde_json::json!({
                        "entity_id": m.entity_id,
                        "config": m.config,
                    }),
                );
            }
            config["integrations"] = Value::Object(integrations);
        }
        Ok(config)
    }

    async fn run_pool(
        &self,
        context: &ExecutionContext,
        timeout_seconds: u32,
        cancel: CancelHandle,
    ) -> Result<PoolOutcome, PoolError> {
        self.exec_pool.execute(context, timeout_seconds, cancel).await
    }

    fn watch_cancellation(&self, execution_id: Uuid) -> CancelHandle {
        let (tx, handle) = CancelHandle::new();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
                if tx.is_closed() {
                    return; // run finished
                }
                match cache.get_pending_execution(execution_id).await {
                    Ok(Some(pending)) if pending.cancelled => {
                        let _ = tx.send(true);
                        return;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return, // reservation gone; nothing to watch
                    Err(err) => {
                        warn!(%execution_id, error = ?err, "cancel poll failed");
                    }
                }
            }
        });
        handle
    }

    async fn publish_execution_update(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        data: Option<Value>,
    ) {
        let message = BusMessage::ExecutionUpdate {
            execution_id,
            status: status.as_str().to_string(),
            data,
        };
        let channel = channels::execution(execution_id);
        if let Err(err) = self.cache.publish(&channel, &message).await {
            warn!(%execution_id, error = ?err, "execution update publish failed");
        }
    }

    async fn publish_history_update(&self, update: HistoryUpdate) {
        let channel = channels::user(update.executed_by);
        let message = BusMessage::HistoryUpdate {
            execution_id: update.execution_id,
            status: update.status.as_str().to_string(),
            workflow_name: update.workflow_name,
            executed_by: update.executed_by,
            executed_by_name: update.executed_by_name,
            org_id: update.org_id,
            started_at: update.started_at,
            completed_at: update.completed_at,
            duration_ms: update.duration_ms,
        };
        if let Err(err) = self.cache.publish(&channel, &message).await {
            warn!(error = ?err, "history update publish failed");
        }
    }

    async fn push_sync_result(
        &self,
        execution_id: Uuid,
        result: &RendezvousResult,
        timeout_seconds: u64,
    ) {
        if let Err(err) = self
            .cache
            .push_result(execution_id, result, timeout_seconds)
            .await
        {
            warn!(%execution_id, error = ?err, "sync result push failed");
        }
    }

    async fn flush_logs(&self, execution_id: Uuid) {
        let entries = match self.cache.read_log_stream(execution_id).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%execution_id, error = ?err, "log stream read failed");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        let rows: Vec<logs::NewLogEntry> = entries
            .into_iter()
            .map(|e| logs::NewLogEntry {
                timestamp: e.timestamp,
                level: e.level,
                message: e.message,
                metadata: e.metadata,
            })
            .collect();
        if let Err(err) = logs::insert_execution_logs(&self.pool, execution_id, &rows).await {
            warn!(%execution_id, error = ?err, "log flush failed");
            return;
        }
        if let Err(err) = self.cache.delete_log_stream(execution_id).await {
            warn!(%execution_id, error = ?err, "log stream delete failed");
        }
    }

    async fn update_metrics(
        &self,
        execution_id: Uuid,
        workflow_id: Option<Uuid>,
        org_id: Option<Uuid>,
        status: ExecutionStatus,
        duration_ms: i64,
        resource: Option<&ResourceMetrics>,
        time_saved: i32,
        value: f64,
    ) {
        if let Err(err) = metrics::update_daily_metrics(
            &self.pool,
            org_id,
            status,
            duration_ms,
            resource,
            time_saved,
            value,
        )
        .await
        {
            warn!(%execution_id, error = ?err, "daily metrics update failed");
        }
        if let Some(workflow_id) = workflow_id {
            if let Err(err) = metrics::update_workflow_roi_daily(
                &self.pool,
                workflow_id,
                org_id,
                status,
                time_saved,
                value,
            )
            .await
            {
                warn!(%execution_id, error = ?err, "workflow ROI update failed");
            }
        }
    }

    async fn update_delivery(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error_message: Option<&str>,
    ) {
        if let Err(err) = bfr_events::update_delivery_from_execution(
            &self.pool,
            &self.cache,
            execution_id,
            status,
            error_message,
        )
        .await
        {
            warn!(%execution_id, error = ?err, "delivery back-propagation failed");
        }
    }
}
