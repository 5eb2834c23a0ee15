//! Shared runtime state for bfr-daemon.

use std::sync::Arc;

use sqlx::PgPool;

use bfr_cache::CacheClient;
use bfr_events::{AdapterRegistry, EventProcessor};
use bfr_queue::AmqpPools;
use bfr_worker::{Intake, SystemEnqueuer};

use crate::auth::TokenVerifier;
use crate::ws::Hub;

/// Static build metadata included in health responses.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cache: CacheClient,
    pub intake: Intake,
    pub processor: Arc<EventProcessor>,
    pub enqueuer: Arc<SystemEnqueuer>,
    pub hub: Arc<Hub>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        cache: CacheClient,
        amqp: AmqpPools,
        registry: Arc<AdapterRegistry>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let intake = Intake::new(pool.clone(), cache.clone(), amqp);
        let processor = Arc::new(EventProcessor::new(
            pool.clone(),
            cache.clone(),
            registry,
        ));
        let enqueuer = Arc::new(SystemEnqueuer::new(intake.clone(), "Event System"));
        Self {
            pool,
            cache,
            intake,
            processor,
            enqueuer,
            hub: Arc::new(Hub::default()),
            verifier,
            build: BuildInfo {
                service: "bfr-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
