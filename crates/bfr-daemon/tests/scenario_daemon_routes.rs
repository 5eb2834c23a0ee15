//! In-process scenario tests for bfr-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket —
//! each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot`. Postgres and the broker are wired lazily
//! (never dialed by the paths under test); Redis needs a live server for
//! the connection manager, so the suite skips itself when none is
//! reachable.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use uuid::Uuid;

use bfr_daemon::{routes, state::AppState};
use bfr_testkit::StaticVerifier;
use tower::ServiceExt; // oneshot

const TEST_TOKEN: &str = "test-token";

async fn make_state() -> Option<AppState> {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let cache = match bfr_cache::CacheClient::connect(&redis_url).await {
        Ok(cache) => cache,
        Err(_) => {
            eprintln!("skipping: no Redis at {redis_url}");
            return None;
        }
    };

    let db_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@127.0.0.1/bifrost".to_string());
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy(&db_url)
        .expect("lazy pool construction cannot fail on a well-formed url");
    let amqp = bfr_queue::AmqpPools::new(
        &std::env::var("RABBITMQ_URL")
            .unwrap_or_else(|_| "amqp://127.0.0.1:5672".to_string()),
    );

    let verifier =
        Arc::new(StaticVerifier::default().with_user(TEST_TOKEN, Uuid::new_v4(), false));
    let registry = Arc::new(bfr_events::AdapterRegistry::with_builtins());
    Some(AppState::new(pool, cache, amqp, registry, verifier))
}

async fn call(
    state: AppState,
    req: Request<axum::body::Body>,
) -> (StatusCode, serde_json::Value) {
    let resp = routes::build_router(state)
        .oneshot(req)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let Some(state) = make_state().await else { return };
    let req = Request::builder()
        .method("GET")
        .uri("/v1/health")
        .body(axum::body::Body::empty())
        .unwrap();

    let (status, json) = call(state, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "bfr-daemon");
}

// ---------------------------------------------------------------------------
// Authentication gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_without_token_is_401() {
    let Some(state) = make_state().await else { return };
    let req = Request::builder()
        .method("POST")
        .uri("/v1/executions")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"parameters": {}}"#))
        .unwrap();

    let (status, _json) = call(state, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn list_without_token_is_401() {
    let Some(state) = make_state().await else { return };
    let req = Request::builder()
        .method("GET")
        .uri("/v1/executions")
        .body(axum::body::Body::empty())
        .unwrap();

    let (status, _json) = call(state, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn execute_with_wrong_token_is_401() {
    let Some(state) = make_state().await else { return };
    let req = Request::builder()
        .method("POST")
        .uri("/v1/executions")
        .header("authorization", "Bearer wrong")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"parameters": {}}"#))
        .unwrap();

    let (status, _json) = call(state, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// POST /v1/executions validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_requires_exactly_one_of_workflow_or_code() {
    let Some(state) = make_state().await else { return };

    // Neither workflow_id nor code.
    let req = Request::builder()
        .method("POST")
        .uri("/v1/executions")
        .header("authorization", format!("Bearer {TEST_TOKEN}"))
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"parameters": {"x": 1}}"#))
        .unwrap();
    let (status, json) = call(state.clone(), req).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(json["detail"].as_str().unwrap().contains("exactly one"));

    // Both at once.
    let body = format!(
        r#"{{"workflow_id": "{}", "code": "cHJpbnQoKQ==", "parameters": {{}}}}"#,
        Uuid::new_v4()
    );
    let req = Request::builder()
        .method("POST")
        .uri("/v1/executions")
        .header("authorization", format!("Bearer {TEST_TOKEN}"))
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();
    let (status, _json) = call(state, req).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

// ---------------------------------------------------------------------------
// POST /api/hooks/:source_id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_webhook_source_id_is_404() {
    let Some(state) = make_state().await else { return };
    let req = Request::builder()
        .method("POST")
        .uri("/api/hooks/not-a-uuid")
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{}"))
        .unwrap();

    let (status, json) = call(state, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["detail"], "Invalid webhook URL");
}
