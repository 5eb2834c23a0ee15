//! Deterministic identifier derivation.
//!
//! **No RNG.** Generated workflow ids use `Uuid::new_v5` over a fixed
//! namespace string so re-indexing the same source tree always lands on
//! the same id — metadata caches, subscriptions and schedules survive an
//! index rebuild.

use uuid::Uuid;

const WORKFLOW_NS: &str = "bifrost.workflow.v1";

/// Stable workflow id for a discovered code unit, derived from its name.
pub fn workflow_id_from_name(name: &str) -> Uuid {
    let data = format!("{WORKFLOW_NS}|{name}");
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, data.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_distinct() {
        assert_eq!(
            workflow_id_from_name("send_invoice"),
            workflow_id_from_name("send_invoice")
        );
        assert_ne!(
            workflow_id_from_name("send_invoice"),
            workflow_id_from_name("send_invoices")
        );
    }
}
