//! bfr-scheduler
//!
//! The single-instance scheduler: cron/interval jobs (schedule-source
//! processing, stuck-execution sweeping, OAuth token refresh, metric
//! snapshots, retention cleanup) plus a pub/sub listener that dispatches
//! on-demand heavyweight operations (reindex, git ops).
//!
//! Running two instances is a correctness bug — cron jobs fire twice. The
//! deployment topology must enforce `replicas: 1`.

pub mod gitops;
pub mod jobs;
pub mod listener;
pub mod reindex;

pub use gitops::{GitOpRequest, GitSync};
pub use listener::handle_scheduler_message;
