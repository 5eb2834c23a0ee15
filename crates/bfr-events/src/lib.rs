//! bfr-events
//!
//! Event ingress: webhook reception, adapter dispatch, event + delivery
//! persistence, deferred execution queueing, and the execution→delivery
//! back-propagation that closes the loop when a queued run finishes.
//!
//! Flow for an accepted webhook:
//!   1. adapter turns the raw request into a `HandleResult`;
//!   2. `Deliver` opens one transaction: event row + one `Pending` delivery
//!      per matching active subscription;
//!   3. after commit, `queue_event_deliveries` enqueues one execution per
//!      delivery (rows must be visible before any worker can back-link);
//!   4. the worker's terminal path calls `update_delivery_from_execution`,
//!      which re-aggregates the event status and broadcasts counts.

pub mod backprop;
pub mod processor;
pub mod protocol;
pub mod registry;

pub use backprop::update_delivery_from_execution;
pub use processor::{queue_event_deliveries, DeliveryEnqueuer, EventProcessor, WebhookOutcome};
pub use protocol::{HandleResult, WebhookRequest};
pub use registry::{AdapterRegistry, GenericAdapter, HandshakeEchoAdapter, WebhookAdapter};
