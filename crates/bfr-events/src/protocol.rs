//! Adapter protocol types.

use std::collections::HashMap;

use serde_json::Value;

/// The raw webhook request as the HTTP layer hands it over. Header names
/// are lowercased before this is built; the body stays raw bytes so
/// adapters can verify signatures over the exact payload.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
    pub client_ip: Option<String>,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Body decoded as JSON; non-JSON bodies surface as a JSON string so
    /// downstream consumers always get a value.
    pub fn body_json(&self) -> Value {
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
    }
}

/// How the HTTP layer must respond to a handled webhook.
#[derive(Debug, Clone)]
pub enum HandleResult {
    /// Handshake echo — returned verbatim, no event is logged.
    Validation {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    /// Refused (bad signature, unknown source, adapter error).
    Rejected { message: String, status: u16 },
    /// Accepted; an event row exists and deliveries will be queued.
    Deliver {
        event_type: String,
        data: Value,
        raw_headers: Value,
    },
}

impl HandleResult {
    pub fn rejected(message: impl Into<String>, status: u16) -> Self {
        HandleResult::Rejected {
            message: message.into(),
            status,
        }
    }
}
