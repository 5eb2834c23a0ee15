//! bfr-worker entry point.
//!
//! Connects Postgres, Redis and RabbitMQ, warms the requirements cache, and
//! runs the workflow-execution consumer until SIGINT/SIGTERM. A dropped
//! broker connection restarts the consumer with a short delay; in-flight
//! messages are redelivered by the broker (at-least-once).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bfr_pool::ExecutionPool;
use bfr_worker::{ProductionBackend, WorkflowExecutionConsumer};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let settings = bfr_config::Settings::from_env()?;

    let pool = bfr_db::connect(&settings.database_url).await?;
    bfr_db::migrate(&pool).await?;
    let cache = bfr_cache::CacheClient::connect(&settings.redis_url).await?;
    let amqp = bfr_queue::AmqpPools::new(&settings.rabbitmq_url);

    match cache.warm_requirements_cache(&pool).await {
        Ok(true) => info!("requirements cache warmed"),
        Ok(false) => info!("requirements.txt not indexed yet; cache not warmed"),
        Err(err) => warn!(error = ?err, "requirements cache warm failed"),
    }

    let exec_pool = ExecutionPool::new(
        &settings.runner_cmd,
        &settings.workspace_dir,
        &settings.redis_url,
        usize::from(settings.max_concurrency),
    );
    let backend = Arc::new(ProductionBackend::new(pool.clone(), cache.clone(), exec_pool));
    let consumer = Arc::new(WorkflowExecutionConsumer::new(
        backend,
        settings.max_concurrency,
    ));

    info!(
        max_concurrency = settings.max_concurrency,
        "bfr-worker starting"
    );

    let amqp_consumer = amqp.clone();
    let consume_loop = tokio::spawn(async move {
        loop {
            match bfr_queue::run_consumer(&amqp_consumer, consumer.clone()).await {
                Ok(()) => warn!("consumer ended; restarting"),
                Err(err) => error!(error = ?err, "consumer failed; restarting"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    // Broadcast listener: workflow metadata invalidations reach every
    // worker instance.
    let invalidator = Arc::new(bfr_worker::WorkflowCacheInvalidator::new(cache.clone()));
    let amqp_broadcast = amqp.clone();
    let invalidation_loop = tokio::spawn(async move {
        loop {
            match bfr_queue::run_broadcast_consumer(&amqp_broadcast, invalidator.clone()).await {
                Ok(()) => warn!("invalidation consumer ended; restarting"),
                Err(err) => error!(error = ?err, "invalidation consumer failed; restarting"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    shutdown_signal().await?;
    info!("shutdown signal received");
    consume_loop.abort();
    invalidation_loop.abort();
    amqp.close().await;
    pool.close().await;
    info!("bfr-worker stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("install SIGINT handler")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
