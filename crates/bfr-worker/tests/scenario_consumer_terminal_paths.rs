//! Scenario tests for the execution consumer's terminal paths.
//!
//! Every test drives `process_execution_message` against the recording
//! backend and asserts the terminal invariants:
//!   - exactly one terminal DB update and one pending delete per message;
//!   - exactly one rendezvous push when `sync`, zero otherwise;
//!   - the per-execution step ordering (create → running publish →
//!     terminal update → terminal publish → pending delete → sync push).

use serde_json::json;
use uuid::Uuid;

use bfr_schemas::{ExecutionQueueMessage, ExecutionStatus, PoolOutcome, RoiData};
use bfr_testkit::{
    make_pending, make_workflow, success_outcome, Call, PoolBehavior, RecordingBackend,
};
use bfr_worker::consumer::process_execution_message;

fn workflow_message(backend: &RecordingBackend, sync: bool) -> ExecutionQueueMessage {
    let execution_id = Uuid::new_v4();
    let workflow_id = Uuid::new_v4();
    backend
        .pending
        .lock()
        .unwrap()
        .insert(execution_id, make_pending(Uuid::new_v4(), None));
    backend
        .metadata
        .lock()
        .unwrap()
        .insert(workflow_id, make_workflow(workflow_id, "echo", 60));
    ExecutionQueueMessage::for_workflow(execution_id, workflow_id, sync)
}

// ---------------------------------------------------------------------------
// Sync success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_success_pushes_exactly_one_matching_result() {
    let backend = RecordingBackend::new()
        .with_pool(PoolBehavior::Outcome(success_outcome(json!({"echo": "hi"}), 8)));
    let message = workflow_message(&backend, true);

    process_execution_message(&backend, &message)
        .await
        .expect("pipeline succeeds");

    let updates = backend.terminal_updates();
    assert_eq!(updates.len(), 1, "exactly one terminal DB update");
    assert_eq!(updates[0].0, ExecutionStatus::Success);
    assert_eq!(updates[0].2, Some(8));

    assert_eq!(backend.pending_deletes(), 1, "exactly one pending delete");

    let pushes = backend.sync_pushes();
    assert_eq!(pushes.len(), 1, "exactly one rendezvous push");
    assert_eq!(pushes[0].0, ExecutionStatus::Success);
}

#[tokio::test]
async fn success_path_step_ordering_is_preserved() {
    let backend = RecordingBackend::new()
        .with_pool(PoolBehavior::Outcome(success_outcome(json!({"ok": true}), 5)));
    let message = workflow_message(&backend, true);

    process_execution_message(&backend, &message).await.unwrap();

    let steps: [fn(&Call) -> bool; 6] = [
        |c| matches!(c, Call::CreateExecution { status: ExecutionStatus::Running, .. }),
        |c| matches!(c, Call::PublishExecution { status: ExecutionStatus::Running, .. }),
        |c| matches!(c, Call::UpdateExecution { status: ExecutionStatus::Success, .. }),
        |c| matches!(c, Call::PublishExecution { status: ExecutionStatus::Success, .. }),
        |c| matches!(c, Call::DeletePending(_)),
        |c| matches!(c, Call::PushSyncResult { .. }),
    ];
    let recorded = backend.recorded();
    let positions: Vec<usize> = steps
        .iter()
        .map(|step| recorded.iter().position(|c| step(c)).expect("step must occur"))
        .collect();

    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "steps must occur in pipeline order");
}

#[tokio::test]
async fn success_runs_metrics_and_delivery_hook() {
    let backend = RecordingBackend::new()
        .with_pool(PoolBehavior::Outcome(success_outcome(json!(1), 3)));
    let message = workflow_message(&backend, false);

    process_execution_message(&backend, &message).await.unwrap();

    let recorded = backend.recorded();
    assert!(recorded
        .iter()
        .any(|c| matches!(c, Call::UpdateMetrics { status: ExecutionStatus::Success, .. })));
    assert!(recorded
        .iter()
        .any(|c| matches!(c, Call::UpdateDelivery { status: ExecutionStatus::Success, .. })));
    assert!(recorded.iter().any(|c| matches!(c, Call::FlushLogs(_))));
}

#[tokio::test]
async fn pool_receives_the_workflow_timeout() {
    let backend = RecordingBackend::new()
        .with_pool(PoolBehavior::Outcome(success_outcome(json!(null), 1)));
    let execution_id = Uuid::new_v4();
    let workflow_id = Uuid::new_v4();
    backend
        .pending
        .lock()
        .unwrap()
        .insert(execution_id, make_pending(Uuid::new_v4(), None));
    backend
        .metadata
        .lock()
        .unwrap()
        .insert(workflow_id, make_workflow(workflow_id, "slow", 900));
    let message = ExecutionQueueMessage::for_workflow(execution_id, workflow_id, false);

    process_execution_message(&backend, &message).await.unwrap();

    assert!(backend
        .recorded()
        .iter()
        .any(|c| matches!(c, Call::RunPool { timeout_seconds: 900, .. })));
}

// ---------------------------------------------------------------------------
// Async failure (UserError)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn async_user_error_writes_failed_without_sync_push() {
    let outcome = PoolOutcome {
        status: "Failed".to_string(),
        result: None,
        error_message: Some("bad input".to_string()),
        error_type: Some("UserError".to_string()),
        duration_ms: 42,
        variables: None,
        metrics: None,
        roi: None,
    };
    let backend = RecordingBackend::new().with_pool(PoolBehavior::Outcome(outcome));
    let message = workflow_message(&backend, false);

    process_execution_message(&backend, &message).await.unwrap();

    let updates = backend.terminal_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, ExecutionStatus::Failed);
    assert_eq!(updates[0].1.as_deref(), Some("UserError"));
    assert_eq!(updates[0].2, Some(42));
    assert!(backend.sync_pushes().is_empty(), "async runs never push");
    assert_eq!(backend.pending_deletes(), 1);
}

#[tokio::test]
async fn unknown_pool_status_maps_to_failed() {
    let outcome = PoolOutcome {
        status: "Bizarre".to_string(),
        result: None,
        error_message: None,
        error_type: None,
        duration_ms: 1,
        variables: None,
        metrics: None,
        roi: None,
    };
    let backend = RecordingBackend::new().with_pool(PoolBehavior::Outcome(outcome));
    let message = workflow_message(&backend, false);

    process_execution_message(&backend, &message).await.unwrap();
    assert_eq!(backend.terminal_updates()[0].0, ExecutionStatus::Failed);
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_writes_timeout_row_and_sync_result() {
    let backend = RecordingBackend::new().with_pool(PoolBehavior::Timeout(5));
    let message = workflow_message(&backend, true);

    process_execution_message(&backend, &message).await.unwrap();

    let updates = backend.terminal_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, ExecutionStatus::Timeout);
    assert_eq!(updates[0].1.as_deref(), Some("TimeoutError"));

    let pushes = backend.sync_pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, ExecutionStatus::Timeout);
    assert_eq!(backend.pending_deletes(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_before_claim_spawns_nothing() {
    let backend = RecordingBackend::new();
    let execution_id = Uuid::new_v4();
    let mut pending = make_pending(Uuid::new_v4(), None);
    pending.cancelled = true;
    backend.pending.lock().unwrap().insert(execution_id, pending);
    let message =
        ExecutionQueueMessage::for_workflow(execution_id, Uuid::new_v4(), true);

    process_execution_message(&backend, &message).await.unwrap();

    assert!(
        !backend
            .recorded()
            .iter()
            .any(|c| matches!(c, Call::RunPool { .. })),
        "no subprocess for a pre-cancelled execution"
    );
    let updates = backend.terminal_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, ExecutionStatus::Cancelled);
    assert_eq!(updates[0].2, Some(0), "zero duration");
    assert_eq!(backend.sync_pushes()[0].0, ExecutionStatus::Cancelled);
    assert_eq!(backend.pending_deletes(), 1);
}

#[tokio::test]
async fn cancel_after_claim_terminates_with_cancelled_row() {
    let backend = RecordingBackend::new().with_pool(PoolBehavior::Cancelled);
    let message = workflow_message(&backend, false);

    process_execution_message(&backend, &message).await.unwrap();

    let updates = backend.terminal_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, ExecutionStatus::Cancelled);
    assert_eq!(backend.pending_deletes(), 1);
}

// ---------------------------------------------------------------------------
// Workflow not found
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_workflow_fails_with_workflow_not_found() {
    let backend = RecordingBackend::new();
    let execution_id = Uuid::new_v4();
    backend
        .pending
        .lock()
        .unwrap()
        .insert(execution_id, make_pending(Uuid::new_v4(), None));
    // No metadata registered: the id resolves to nothing.
    let message = ExecutionQueueMessage::for_workflow(execution_id, Uuid::new_v4(), true);

    process_execution_message(&backend, &message).await.unwrap();

    let rows = backend.created_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "unknown");

    let updates = backend.terminal_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, ExecutionStatus::Failed);
    assert_eq!(updates[0].1.as_deref(), Some("WorkflowNotFound"));

    let pushes = backend.sync_pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].1.as_deref(), Some("WorkflowNotFound"));
}

// ---------------------------------------------------------------------------
// Replayed / reaped message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replayed_message_creates_no_row() {
    let backend = RecordingBackend::new();
    let message = ExecutionQueueMessage::for_workflow(Uuid::new_v4(), Uuid::new_v4(), false);

    process_execution_message(&backend, &message).await.unwrap();

    assert!(backend.created_rows().is_empty());
    assert!(backend.terminal_updates().is_empty());
    assert!(backend.sync_pushes().is_empty());
}

#[tokio::test]
async fn replayed_sync_message_pushes_pending_not_found() {
    let backend = RecordingBackend::new();
    let message = ExecutionQueueMessage::for_workflow(Uuid::new_v4(), Uuid::new_v4(), true);

    process_execution_message(&backend, &message).await.unwrap();

    assert!(backend.created_rows().is_empty());
    let pushes = backend.sync_pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, ExecutionStatus::Failed);
    assert_eq!(pushes[0].1.as_deref(), Some("PendingNotFound"));
}

// ---------------------------------------------------------------------------
// Internal error → DLQ
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runner_failure_records_internal_error_and_reraises() {
    let backend =
        RecordingBackend::new().with_pool(PoolBehavior::RunnerError("runner exploded".to_string()));
    let message = workflow_message(&backend, true);

    let err = process_execution_message(&backend, &message)
        .await
        .expect_err("must re-raise for dead-lettering");
    assert!(err.to_string().contains("runner exploded"));

    let updates = backend.terminal_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, ExecutionStatus::Failed);
    assert_eq!(updates[0].1.as_deref(), Some("InternalError"));
    assert_eq!(backend.pending_deletes(), 1);
    assert_eq!(backend.sync_pushes().len(), 1);
}

// ---------------------------------------------------------------------------
// Org fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn org_scope_falls_back_to_the_workflow() {
    let backend = RecordingBackend::new()
        .with_pool(PoolBehavior::Outcome(success_outcome(json!(null), 1)));
    let execution_id = Uuid::new_v4();
    let workflow_id = Uuid::new_v4();
    let workflow_org = Uuid::new_v4();

    backend
        .pending
        .lock()
        .unwrap()
        .insert(execution_id, make_pending(Uuid::new_v4(), None));
    let mut meta = make_workflow(workflow_id, "scoped", 60);
    meta.organization_id = Some(workflow_org);
    backend.metadata.lock().unwrap().insert(workflow_id, meta);

    let message = ExecutionQueueMessage::for_workflow(execution_id, workflow_id, false);
    process_execution_message(&backend, &message).await.unwrap();

    assert!(backend.recorded().iter().any(|c| matches!(
        c,
        Call::CreateExecution { org_id: Some(org), .. } if *org == workflow_org
    )));
}

// ---------------------------------------------------------------------------
// ROI merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outcome_roi_overrides_workflow_defaults() {
    let mut outcome = success_outcome(json!(null), 2);
    outcome.roi = Some(RoiData {
        time_saved: 99,
        value: 7.5,
    });
    let backend = RecordingBackend::new().with_pool(PoolBehavior::Outcome(outcome));
    let message = workflow_message(&backend, false);

    process_execution_message(&backend, &message).await.unwrap();

    assert!(backend.recorded().iter().any(|c| matches!(
        c,
        Call::UpdateMetrics { time_saved: 99, value, .. } if (*value - 7.5).abs() < f64::EPSILON
    )));
}

#[tokio::test]
async fn workflow_roi_defaults_apply_when_outcome_has_none() {
    let backend = RecordingBackend::new()
        .with_pool(PoolBehavior::Outcome(success_outcome(json!(null), 2)));
    // make_workflow fixes time_saved = 5, value = 1.5.
    let message = workflow_message(&backend, false);

    process_execution_message(&backend, &message).await.unwrap();

    assert!(backend.recorded().iter().any(|c| matches!(
        c,
        Call::UpdateMetrics { time_saved: 5, value, .. } if (*value - 1.5).abs() < f64::EPSILON
    )));
}
