//! bfr-worker
//!
//! The workflow-execution consumer: claims queue messages, resolves the
//! pending context and workflow metadata, drives the execution pool, and
//! owns every terminal path — exactly one DB terminal write, exactly one
//! pending delete, and (for sync requests) exactly one rendezvous push per
//! message.
//!
//! Side effects go through the `WorkerBackend` seam so the pipeline's step
//! ordering and terminal invariants are testable without live services;
//! `ProductionBackend` wires Postgres, Redis, the AMQP pools and the
//! execution pool.

pub mod backend;
pub mod consumer;
pub mod dataprovider;
pub mod intake;
pub mod invalidation;
pub mod metadata;

pub use backend::{ProductionBackend, WorkerBackend};
pub use consumer::WorkflowExecutionConsumer;
pub use intake::{Intake, SystemEnqueuer, WorkflowExecutionResponse};
pub use invalidation::WorkflowCacheInvalidator;
