//! Axum router and all HTTP handlers for bfr-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are `pub(crate)` so the scenario
//! tests in `tests/` can compose the router directly.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{
        ws::WebSocketUpgrade,
        Path, Query, State,
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use bfr_db::executions::{ExecutionFilter, Principal};
use bfr_events::{HandleResult, WebhookRequest};
use bfr_schemas::{channels, ExecutionStatus};
use bfr_worker::intake::IntakeCaller;

use crate::auth::{bearer_token, AuthUser};
use crate::state::AppState;
use crate::ws;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/executions", post(execute).get(list_executions))
        .route("/v1/executions/:id", get(get_execution))
        .route("/v1/executions/:id/cancel", post(cancel_execution))
        .route("/v1/executions/:id/logs", get(get_execution_logs))
        .route("/v1/executions/:id/result", get(get_execution_result))
        .route("/api/hooks/:source_id", any(receive_webhook))
        .route("/ws/connect", get(ws_connect))
        .route("/ws/execution/:id", get(ws_execution))
        .with_state(state)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "Not authenticated"})),
    )
        .into_response()
}

/// Resolve the caller from the Authorization header.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, Response> {
    bearer_token(headers)
        .and_then(|token| state.verifier.verify(token))
        .ok_or_else(unauthorized)
}

fn principal(user: &AuthUser) -> Principal {
    Principal {
        user_id: user.user_id,
        is_admin: user.is_admin,
    }
}

/// "Forbidden" errors from the read layer map to 403; everything else 500.
fn read_error(err: anyhow::Error) -> Response {
    if err.to_string() == "Forbidden" {
        (
            StatusCode::FORBIDDEN,
            Json(json!({"detail": "Forbidden"})),
        )
            .into_response()
    } else {
        error!(error = ?err, "execution read failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": "Internal error"})),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "service": st.build.service,
            "version": st.build.version,
        })),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/executions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct ExecuteRequest {
    workflow_id: Option<Uuid>,
    code: Option<String>,
    script_name: Option<String>,
    #[serde(default)]
    parameters: Value,
    form_id: Option<Uuid>,
    org_id: Option<Uuid>,
    #[serde(default)]
    sync: bool,
}

pub(crate) async fn execute(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExecuteRequest>,
) -> Response {
    let user = match authenticate(&st, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let caller = IntakeCaller {
        user_id: user.user_id,
        user_name: user.name.clone(),
        user_email: user.email.clone(),
        org_id: body.org_id,
    };
    let parameters = if body.parameters.is_null() {
        json!({})
    } else {
        body.parameters
    };

    let result = match (body.workflow_id, body.code) {
        (Some(workflow_id), None) => {
            st.intake
                .run_workflow(
                    &caller,
                    workflow_id,
                    parameters,
                    body.form_id,
                    None,
                    None,
                    body.sync,
                )
                .await
        }
        (None, Some(code)) => {
            let script_name = body.script_name.as_deref().unwrap_or("inline_script");
            st.intake.run_code(&caller, &code, script_name, parameters).await
        }
        _ => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"detail": "Provide exactly one of workflow_id or code"})),
            )
                .into_response();
        }
    };

    match result {
        Ok(response) => {
            let status = if response.status == ExecutionStatus::Pending {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            (status, Json(response)).into_response()
        }
        Err(err) if err.to_string().contains("not found") => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": err.to_string()})),
        )
            .into_response(),
        Err(err) => {
            error!(error = ?err, "execution intake failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "Failed to enqueue execution"})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/executions/:id/cancel
// ---------------------------------------------------------------------------

pub(crate) async fn cancel_execution(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authenticate(&st, &headers) {
        return resp;
    }

    match st.intake.cancel_execution(id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"execution_id": id, "status": "Cancelling"})),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Execution is not pending or running"})),
        )
            .into_response(),
        Err(err) => {
            error!(%id, error = ?err, "cancel failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "Internal error"})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/executions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    workflow_name: Option<String>,
    status: Option<String>,
    org_id: Option<Uuid>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

pub(crate) async fn list_executions(
    State(st): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let user = match authenticate(&st, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let filter = ExecutionFilter {
        org_id: query.org_id,
        workflow_name: query.workflow_name,
        status: query.status.as_deref().and_then(ExecutionStatus::parse),
        started_after: None,
        started_before: None,
        limit: query.limit.unwrap_or(25),
        offset: query.offset.unwrap_or(0),
    };

    match bfr_db::executions::list_executions(&st.pool, &principal(&user), &filter).await {
        Ok((executions, next_offset)) => (
            StatusCode::OK,
            Json(json!({
                "executions": executions.iter().map(execution_json).collect::<Vec<_>>(),
                "continuation_token": next_offset.map(|o| o.to_string()),
            })),
        )
            .into_response(),
        Err(err) => read_error(err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/executions/:id
// ---------------------------------------------------------------------------

pub(crate) async fn get_execution(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticate(&st, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match bfr_db::executions::get_execution(&st.pool, id, &principal(&user)).await {
        Ok(Some(execution)) => (StatusCode::OK, Json(execution_json(&execution))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Execution not found"})),
        )
            .into_response(),
        Err(err) => read_error(err),
    }
}

fn execution_json(e: &bfr_db::ExecutionRow) -> Value {
    json!({
        "execution_id": e.id,
        "workflow_name": e.workflow_name,
        "org_id": e.organization_id,
        "form_id": e.form_id,
        "status": e.status.as_str(),
        "input_data": e.parameters,
        "result": e.result,
        "result_type": e.result_type,
        "error_message": e.error_message,
        "error_type": e.error_type,
        "duration_ms": e.duration_ms,
        "started_at": e.started_at.map(|t| t.and_utc().to_rfc3339()),
        "completed_at": e.completed_at.map(|t| t.and_utc().to_rfc3339()),
        "executed_by": e.executed_by,
        "executed_by_name": e.executed_by_name,
        "variables": e.variables,
        "peak_memory_bytes": e.peak_memory_bytes,
        "cpu_total_seconds": e.cpu_total_seconds,
    })
}

// ---------------------------------------------------------------------------
// GET /v1/executions/:id/logs
// ---------------------------------------------------------------------------

pub(crate) async fn get_execution_logs(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticate(&st, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match bfr_db::logs::fetch_execution_logs(&st.pool, id, &principal(&user)).await {
        Ok(logs) => {
            let entries: Vec<Value> = logs
                .iter()
                .map(|log| {
                    json!({
                        "sequence": log.sequence,
                        "timestamp": log.timestamp.and_utc().to_rfc3339(),
                        "level": log.level.as_str(),
                        "message": log.message,
                        "data": log.metadata,
                    })
                })
                .collect();
            (StatusCode::OK, Json(json!({"logs": entries}))).into_response()
        }
        Err(err) => read_error(err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/executions/:id/result
// ---------------------------------------------------------------------------

pub(crate) async fn get_execution_result(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticate(&st, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match bfr_db::executions::get_execution_result(&st.pool, id, &principal(&user)).await {
        Ok(Some((result, result_type))) => (
            StatusCode::OK,
            Json(json!({"result": result, "result_type": result_type})),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Execution not found"})),
        )
            .into_response(),
        Err(err) => read_error(err),
    }
}

// ---------------------------------------------------------------------------
// POST /api/hooks/:source_id
// ---------------------------------------------------------------------------

pub(crate) async fn receive_webhook(
    State(st): State<AppState>,
    Path(source_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    method: axum::http::Method,
    body: Bytes,
) -> Response {
    let lower_headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let client_ip = lower_headers
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let request = WebhookRequest {
        method: method.to_string(),
        path: format!("/api/hooks/{source_id}"),
        headers: lower_headers,
        query,
        body: body.to_vec(),
        client_ip,
    };

    let outcome = st.processor.process_webhook(&source_id, &request).await;

    // Deferred enqueue: the delivery rows are committed; queue them off the
    // request path and ack immediately.
    if let Some(event_id) = outcome.event_id {
        let pool = st.pool.clone();
        let cache = st.cache.clone();
        let enqueuer = st.enqueuer.clone();
        tokio::spawn(async move {
            if let Err(err) =
                bfr_events::queue_event_deliveries(&pool, &cache, enqueuer.as_ref(), event_id).await
            {
                error!(%event_id, error = ?err, "queue_event_deliveries failed");
            }
        });
    }

    match outcome.result {
        HandleResult::Validation {
            status,
            headers,
            body,
        } => {
            let mut response = (
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                body,
            )
                .into_response();
            for (name, value) in headers {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<HeaderName>(),
                    HeaderValue::from_str(&value),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
            response
        }
        HandleResult::Rejected { message, status } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
            Json(json!({"detail": message})),
        )
            .into_response(),
        HandleResult::Deliver { event_type, .. } => {
            info!(source_id, event_type, "webhook accepted");
            (
                StatusCode::ACCEPTED,
                Json(json!({"status": "accepted", "event_type": event_type})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket endpoints
// ---------------------------------------------------------------------------

pub(crate) async fn ws_connect(
    State(st): State<AppState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let user = bearer_token(&headers).and_then(|token| st.verifier.verify(token));
    let hub = st.hub.clone();

    // Accept first, then close with 4001 on auth failure — a close code
    // can only be sent on an upgraded transport.
    upgrade.on_upgrade(move |socket| async move {
        match user {
            Some(user) => ws::run_session(socket, user, Vec::new(), hub).await,
            None => ws::close_unauthorized(socket).await,
        }
    })
}

/// Single-execution observation: subscribes exactly that channel.
pub(crate) async fn ws_execution(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let user = bearer_token(&headers).and_then(|token| st.verifier.verify(token));
    let hub = st.hub.clone();

    upgrade.on_upgrade(move |socket| async move {
        match user {
            Some(user) => {
                ws::run_session(socket, user, vec![channels::execution(id)], hub).await
            }
            None => ws::close_unauthorized(socket).await,
        }
    })
}
