//! bfr-schemas
//!
//! Shared wire and domain types for the execution fabric: status enums,
//! queue message shapes, pub/sub payloads, channel/key naming, and the
//! execution context handed to the isolated subprocess runner.
//!
//! Everything here is plain data — no I/O, no async. The naming modules
//! (`channels`, `keys`) are the single authority for Redis channel and key
//! strings; publishers and subscribers must go through them so the two sides
//! can never drift.

pub mod bus;
pub mod channels;
pub mod context;
pub mod ids;
pub mod keys;
pub mod messages;
pub mod status;

pub use bus::{BusMessage, EventCounts, EventSummary};
pub use context::{
    Caller, ExecutionContext, OrganizationRef, PendingExecution, PoolOutcome, ResourceMetrics,
    RoiData, WorkflowMetadata,
};
pub use messages::{ExecutionQueueMessage, RendezvousResult, WORKFLOW_EXECUTIONS_QUEUE};
pub use status::{DeliveryStatus, EventStatus, ExecutionStatus, LogLevel, ResultKind};
