//! Adapter registry.
//!
//! Adapters register under a name string at startup; webhook dispatch is a
//! map lookup. The two built-ins cover plain JSON sources and
//! handshake-style sources; integration-specific adapters are external and
//! register themselves the same way.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::{HandleResult, WebhookRequest};

/// One webhook adapter. `state` is the adapter-managed mutable blob stored
/// on the webhook source (handshake markers, dedup cursors, tokens) —
/// mutations are persisted after the call.
#[async_trait]
pub trait WebhookAdapter: Send + Sync {
    async fn handle_request(
        &self,
        request: &WebhookRequest,
        config: &Value,
        state: &mut Value,
    ) -> Result<HandleResult>;
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn WebhookAdapter>>,
}

impl AdapterRegistry {
    /// Registry pre-loaded with the built-in adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("generic", Arc::new(GenericAdapter));
        registry.register("handshake-echo", Arc::new(HandshakeEchoAdapter));
        registry
    }

    pub fn register(&mut self, name: &str, adapter: Arc<dyn WebhookAdapter>) {
        self.adapters.insert(name.to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WebhookAdapter>> {
        self.adapters.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// GenericAdapter
// ---------------------------------------------------------------------------

/// Accepts any JSON payload. Event type resolution order: configured body
/// field (`event_type_field`), `x-event-type` header, `event_type` query
/// parameter, then the configured default.
pub struct GenericAdapter;

#[async_trait]
impl WebhookAdapter for GenericAdapter {
    async fn handle_request(
        &self,
        request: &WebhookRequest,
        config: &Value,
        _state: &mut Value,
    ) -> Result<HandleResult> {
        let data = request.body_json();

        let from_body = config
            .get("event_type_field")
            .and_then(Value::as_str)
            .and_then(|field| data.get(field))
            .and_then(Value::as_str);

        let event_type = from_body
            .or_else(|| request.header("x-event-type"))
            .or_else(|| request.query.get("event_type").map(String::as_str))
            .or_else(|| config.get("default_event_type").and_then(Value::as_str))
            .unwrap_or("webhook.received")
            .to_string();

        Ok(HandleResult::Deliver {
            event_type,
            data,
            raw_headers: serde_json::to_value(&request.headers)?,
        })
    }
}

// ---------------------------------------------------------------------------
// HandshakeEchoAdapter
// ---------------------------------------------------------------------------

/// Subscription-style sources that probe the endpoint with a validation
/// token before delivering events. The token echo is returned verbatim and
/// never logged as an event; ordinary requests fall through to the generic
/// behavior. Remembers the completed handshake in adapter state.
pub struct HandshakeEchoAdapter;

#[async_trait]
impl WebhookAdapter for HandshakeEchoAdapter {
    async fn handle_request(
        &self,
        request: &WebhookRequest,
        config: &Value,
        state: &mut Value,
    ) -> Result<HandleResult> {
        let param = config
            .get("validation_param")
            .and_then(Value::as_str)
            .unwrap_or("validationToken");

        if let Some(token) = request.query.get(param) {
            if let Value::Object(map) = state {
                map.insert("handshake_completed".to_string(), Value::Bool(true));
            }
            return Ok(HandleResult::Validation {
                status: 200,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: token.clone(),
            });
        }

        GenericAdapter.handle_request(request, config, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn make_request(body: &Value, query: &[(&str, &str)]) -> WebhookRequest {
        WebhookRequest {
            method: "POST".to_string(),
            path: "/api/hooks/test".to_string(),
            headers: HashMap::new(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: serde_json::to_vec(body).unwrap(),
            client_ip: Some("203.0.113.9".to_string()),
        }
    }

    #[tokio::test]
    async fn generic_adapter_reads_event_type_from_body_field() {
        let req = make_request(&json!({"event": "order.created", "id": 7}), &[]);
        let config = json!({"event_type_field": "event"});
        let mut state = json!({});
        let result = GenericAdapter
            .handle_request(&req, &config, &mut state)
            .await
            .unwrap();
        match result {
            HandleResult::Deliver { event_type, data, .. } => {
                assert_eq!(event_type, "order.created");
                assert_eq!(data["id"], 7);
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn generic_adapter_defaults_event_type() {
        let req = make_request(&json!({"k": 1}), &[]);
        let mut state = json!({});
        let result = GenericAdapter
            .handle_request(&req, &json!({}), &mut state)
            .await
            .unwrap();
        match result {
            HandleResult::Deliver { event_type, .. } => {
                assert_eq!(event_type, "webhook.received")
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_echo_returns_token_verbatim_and_marks_state() {
        let req = make_request(&json!({}), &[("validationToken", "abc123")]);
        let mut state = json!({});
        let result = HandshakeEchoAdapter
            .handle_request(&req, &json!({}), &mut state)
            .await
            .unwrap();
        match result {
            HandleResult::Validation { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, "abc123");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        assert_eq!(state["handshake_completed"], true);
    }

    #[tokio::test]
    async fn handshake_echo_delivers_ordinary_requests() {
        let req = make_request(&json!({"event": "sub.fired"}), &[]);
        let mut state = json!({});
        let result = HandshakeEchoAdapter
            .handle_request(&req, &json!({"event_type_field": "event"}), &mut state)
            .await
            .unwrap();
        assert!(matches!(result, HandleResult::Deliver { .. }));
    }

    #[test]
    fn registry_lookup_is_by_name() {
        let registry = AdapterRegistry::with_builtins();
        assert!(registry.get("generic").is_some());
        assert!(registry.get("handshake-echo").is_some());
        assert!(registry.get("salesforce").is_none());
    }
}
