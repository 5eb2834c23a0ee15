//! bfr-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, connects the
//! backing services, wires middleware, starts the WebSocket relay, and
//! serves HTTP. All route handlers live in `routes.rs`; shared state in
//! `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use bfr_daemon::{routes, state::AppState, ws, EnvTokenVerifier};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = bfr_config::Settings::from_env()?;
    let pool = bfr_db::connect(&settings.database_url).await?;
    bfr_db::migrate(&pool).await?;
    let cache = bfr_cache::CacheClient::connect(&settings.redis_url).await?;
    let amqp = bfr_queue::AmqpPools::new(&settings.rabbitmq_url);

    let registry = Arc::new(bfr_events::AdapterRegistry::with_builtins());
    let verifier = Arc::new(EnvTokenVerifier::from_env());
    let shared = AppState::new(pool, cache.clone(), amqp, registry, verifier);

    // Cross-instance WebSocket delivery: every instance relays the fabric
    // channels from Redis into its local hub.
    ws::spawn_relay(cache.client().clone(), shared.hub.clone());

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000)));
    info!("bfr-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(bfr_config::ENV_DAEMON_ADDR).ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
