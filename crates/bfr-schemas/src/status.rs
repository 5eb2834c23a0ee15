//! Status enums shared across the fabric.
//!
//! All of these are stored in Postgres as their canonical string form and
//! travel over the wire (queue messages, pub/sub payloads) the same way, so
//! each enum carries an `as_str` / `parse` pair instead of relying on serde
//! representation details.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of one execution.
///
/// Transitions are monotone toward a terminal state; a terminal row is never
/// re-opened. `Cancelling` is the intent bit set by the surface while the
/// worker decides whether the run can still be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    Cancelling,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Success => "Success",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Timeout => "Timeout",
            ExecutionStatus::Cancelled => "Cancelled",
            ExecutionStatus::Cancelling => "Cancelling",
        }
    }

    /// Parse a canonical status string. Unknown strings map to `Failed` —
    /// the pool's outcome document is untrusted input and a bad status must
    /// not wedge the terminal write.
    pub fn parse_lenient(s: &str) -> Self {
        Self::parse(s).unwrap_or(ExecutionStatus::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(ExecutionStatus::Pending),
            "Running" => Some(ExecutionStatus::Running),
            "Success" => Some(ExecutionStatus::Success),
            "Failed" => Some(ExecutionStatus::Failed),
            "Timeout" => Some(ExecutionStatus::Timeout),
            "Cancelled" => Some(ExecutionStatus::Cancelled),
            "Cancelling" => Some(ExecutionStatus::Cancelling),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventStatus
// ---------------------------------------------------------------------------

/// Aggregate state of one accepted webhook event, derived from its
/// deliveries: all success → `Completed`, mixed → `PartiallyFailed`,
/// all failed → `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Received,
    Processing,
    Completed,
    PartiallyFailed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "Received",
            EventStatus::Processing => "Processing",
            EventStatus::Completed => "Completed",
            EventStatus::PartiallyFailed => "PartiallyFailed",
            EventStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Received" => Some(EventStatus::Received),
            "Processing" => Some(EventStatus::Processing),
            "Completed" => Some(EventStatus::Completed),
            "PartiallyFailed" => Some(EventStatus::PartiallyFailed),
            "Failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DeliveryStatus
// ---------------------------------------------------------------------------

/// State of one event→subscription delivery binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Queued,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "Pending",
            DeliveryStatus::Queued => "Queued",
            DeliveryStatus::Success => "Success",
            DeliveryStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(DeliveryStatus::Pending),
            "Queued" => Some(DeliveryStatus::Queued),
            "Success" => Some(DeliveryStatus::Success),
            "Failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    /// Map a finished execution's status onto the delivery that spawned it.
    /// Only `Success` counts; everything else (failure, timeout, cancel) is
    /// a failed delivery.
    pub fn from_execution(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => DeliveryStatus::Success,
            _ => DeliveryStatus::Failed,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

/// Level of one execution log entry. `Debug` and `Traceback` are
/// admin-only and stripped before non-admin reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Traceback,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Traceback => "traceback",
        }
    }

    /// Unknown levels default to `Info` — log entries come from user code.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "traceback" => LogLevel::Traceback,
            _ => LogLevel::Info,
        }
    }

    pub fn is_admin_only(&self) -> bool {
        matches!(self, LogLevel::Debug | LogLevel::Traceback)
    }
}

// ---------------------------------------------------------------------------
// ResultKind
// ---------------------------------------------------------------------------

/// Content-kind tag stored next to an execution result so the surface can
/// render it without sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Json,
    Text,
    Html,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Json => "json",
            ResultKind::Text => "text",
            ResultKind::Html => "html",
        }
    }

    /// Classify a result value: objects and arrays are `json`; strings are
    /// `html` when the first non-whitespace char is `<`, otherwise `text`;
    /// anything else falls back to `json`.
    pub fn infer(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => ResultKind::Json,
            serde_json::Value::String(s) => {
                if s.trim_start().starts_with('<') {
                    ResultKind::Html
                } else {
                    ResultKind::Text
                }
            }
            _ => ResultKind::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_status_round_trips() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Cancelling,
        ] {
            assert_eq!(ExecutionStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn unknown_pool_status_maps_to_failed() {
        assert_eq!(
            ExecutionStatus::parse_lenient("Exploded"),
            ExecutionStatus::Failed
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Cancelling.is_terminal());
    }

    #[test]
    fn delivery_status_from_execution() {
        assert_eq!(
            DeliveryStatus::from_execution(ExecutionStatus::Success),
            DeliveryStatus::Success
        );
        for s in [
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(DeliveryStatus::from_execution(s), DeliveryStatus::Failed);
        }
    }

    #[test]
    fn result_kind_inference() {
        assert_eq!(ResultKind::infer(&json!({"a": 1})), ResultKind::Json);
        assert_eq!(ResultKind::infer(&json!([1, 2])), ResultKind::Json);
        assert_eq!(ResultKind::infer(&json!("hello")), ResultKind::Text);
        assert_eq!(
            ResultKind::infer(&json!("  <html><body/></html>")),
            ResultKind::Html
        );
        assert_eq!(ResultKind::infer(&json!(42)), ResultKind::Json);
    }

    #[test]
    fn admin_only_log_levels() {
        assert!(LogLevel::Debug.is_admin_only());
        assert!(LogLevel::Traceback.is_admin_only());
        assert!(!LogLevel::Info.is_admin_only());
        assert_eq!(LogLevel::parse_lenient("WARN"), LogLevel::Warning);
        assert_eq!(LogLevel::parse_lenient("nonsense"), LogLevel::Info);
    }
}
