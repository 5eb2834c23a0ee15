//! bfr-db
//!
//! Postgres persistence for the execution fabric. Plain sqlx queries, no
//! ORM: each module owns one table family and exposes free functions over a
//! `PgPool`. Status enums are stored as their canonical strings
//! (`bfr_schemas::status`), timestamps as timezone-naive UTC.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod events;
pub mod executions;
pub mod logs;
pub mod metrics;
pub mod orgs;
pub mod workflows;

pub use events::{
    DeliveryRow, EventRow, NewEvent, SubscriptionRow, WebhookSourceRow,
};
pub use executions::{ExecutionRow, NewExecution, Principal, TerminalUpdate};
pub use logs::ExecutionLogRow;
pub use workflows::WorkflowRow;

/// Open the process-wide pool. Sized for one fabric binary: the worker's
/// prefetch-bounded tasks, or the daemon's request handlers — never both
/// in one process.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Bring the schema up to date. Binaries call this once at startup so a
/// fresh database and a long-lived one look identical to the code.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Pool for the integration suites: reads DATABASE_URL and migrates, so
/// every scenario test starts against the current schema.
pub async fn test_pool_from_env() -> Result<PgPool> {
    let url = std::env::var("DATABASE_URL").context("missing env var DATABASE_URL")?;
    let pool = connect(&url).await?;
    migrate(&pool).await?;
    Ok(pool)
}
