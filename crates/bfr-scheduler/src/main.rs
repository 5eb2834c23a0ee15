//! bfr-scheduler entry point.
//!
//! MUST run as a single instance (replicas: 1): cron jobs fire per
//! instance, so two schedulers double-fire every job.

use std::path::PathBuf;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use bfr_cache::{CacheClient, ResilientSubscriber};
use bfr_scheduler::{handle_scheduler_message, jobs, listener};
use bfr_worker::Intake;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let settings = bfr_config::Settings::from_env()?;
    info!("starting bifrost scheduler");

    let pool = bfr_db::connect(&settings.database_url).await?;
    bfr_db::migrate(&pool).await?;
    let cache = CacheClient::connect(&settings.redis_url).await?;
    let amqp = bfr_queue::AmqpPools::new(&settings.rabbitmq_url);
    let intake = Intake::new(pool.clone(), cache.clone(), amqp.clone());
    let http = reqwest::Client::new();
    let workspace_dir = PathBuf::from(&settings.workspace_dir);

    // Boot-time passes for the jobs that also run at startup.
    run_and_log("execution_cleanup", jobs::cleanup_stuck_executions(&pool, &cache)).await;
    run_and_log("stuck_event_cleanup", jobs::cleanup_stuck_deliveries(&pool)).await;
    run_and_log("oauth_token_refresh", jobs::refresh_expiring_tokens(&pool, &http)).await;
    run_and_log("metrics_refresh", jobs::refresh_metrics_snapshot(&pool)).await;

    let sched = build_job_scheduler(&pool, &cache, &intake, &http).await?;
    sched.start().await.context("scheduler start failed")?;
    info!("cron jobs scheduled");

    // On-demand listener with auto-reconnect.
    let (tx, mut rx) = mpsc::channel(64);
    let subscriber =
        ResilientSubscriber::spawn(cache.client().clone(), listener::scheduler_channels(), tx);
    let dispatch_pool = pool.clone();
    let dispatch_cache = cache.clone();
    let dispatch_dir = workspace_dir.clone();
    let dispatcher = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            handle_scheduler_message(&dispatch_pool, &dispatch_cache, &dispatch_dir, message).await;
        }
    });
    info!("pub/sub listener started (with auto-reconnect)");

    shutdown_signal().await?;
    info!("shutdown signal received");

    subscriber.stop().await;
    dispatcher.abort();
    let mut sched = sched;
    let _ = sched.shutdown().await;
    amqp.close().await;
    pool.close().await;
    info!("bifrost scheduler stopped");
    Ok(())
}

/// All interval/cron jobs. Six-field expressions (seconds first), UTC.
async fn build_job_scheduler(
    pool: &PgPool,
    cache: &CacheClient,
    intake: &Intake,
    http: &reqwest::Client,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("scheduler init failed")?;

    // Schedule-source processor - every 1 minute.
    {
        let pool = pool.clone();
        let intake = intake.clone();
        sched
            .add(Job::new_async("0 */1 * * * *", move |_id, _l| {
                let pool = pool.clone();
                let intake = intake.clone();
                Box::pin(async move {
                    run_and_log("schedule_processor", jobs::process_schedule_sources(&pool, &intake))
                        .await;
                })
            })?)
            .await?;
    }

    // Stuck-execution sweeper - every 5 minutes.
    {
        let pool = pool.clone();
        let cache = cache.clone();
        sched
            .add(Job::new_async("0 */5 * * * *", move |_id, _l| {
                let pool = pool.clone();
                let cache = cache.clone();
                Box::pin(async move {
                    run_and_log("execution_cleanup", jobs::cleanup_stuck_executions(&pool, &cache))
                        .await;
                })
            })?)
            .await?;
    }

    // OAuth token refresh - every 15 minutes.
    {
        let pool = pool.clone();
        let http = http.clone();
        sched
            .add(Job::new_async("0 */15 * * * *", move |_id, _l| {
                let pool = pool.clone();
                let http = http.clone();
                Box::pin(async move {
                    run_and_log("oauth_token_refresh", jobs::refresh_expiring_tokens(&pool, &http))
                        .await;
                })
            })?)
            .await?;
    }

    // Metrics snapshot - hourly.
    {
        let pool = pool.clone();
        sched
            .add(Job::new_async("0 0 * * * *", move |_id, _l| {
                let pool = pool.clone();
                Box::pin(async move {
                    run_and_log("metrics_refresh", jobs::refresh_metrics_snapshot(&pool)).await;
                })
            })?)
            .await?;
    }

    // Knowledge storage daily - 02:00 UTC.
    {
        let pool = pool.clone();
        sched
            .add(Job::new_async("0 0 2 * * *", move |_id, _l| {
                let pool = pool.clone();
                Box::pin(async move {
                    run_and_log(
                        "knowledge_storage_refresh",
                        jobs::refresh_knowledge_storage_daily(&pool),
                    )
                    .await;
                })
            })?)
            .await?;
    }

    // Webhook subscription renewal - every 6 hours.
    {
        let pool = pool.clone();
        sched
            .add(Job::new_async("0 0 */6 * * *", move |_id, _l| {
                let pool = pool.clone();
                Box::pin(async move {
                    run_and_log("webhook_renewal", jobs::renew_expiring_webhooks(&pool)).await;
                })
            })?)
            .await?;
    }

    // Event retention cleanup - daily 03:00 UTC.
    {
        let pool = pool.clone();
        sched
            .add(Job::new_async("0 0 3 * * *", move |_id, _l| {
                let pool = pool.clone();
                Box::pin(async move {
                    run_and_log("event_cleanup", jobs::cleanup_old_events(&pool)).await;
                })
            })?)
            .await?;
    }

    // Stuck-delivery cleanup - every 5 minutes.
    {
        let pool = pool.clone();
        sched
            .add(Job::new_async("0 */5 * * * *", move |_id, _l| {
                let pool = pool.clone();
                Box::pin(async move {
                    run_and_log("stuck_event_cleanup", jobs::cleanup_stuck_deliveries(&pool)).await;
                })
            })?)
            .await?;
    }

    Ok(sched)
}

async fn run_and_log<T, F>(job: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<T>>,
{
    if let Err(err) = fut.await {
        error!(job, error = ?err, "scheduled job failed");
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("install SIGINT handler")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
