//! Automation-facing wire shapes.
//!
//! Automation clients submit request envelopes and receive typed
//! responses plus pushed notifications. The response builders here are
//! the single source of the wire shapes; the correlator and the HTTP
//! surface both go through them.
//!
//! # Envelopes
//!
//! Request: `{sessionId, requestId, action, …params}`.
//!
//! Response: `{type: "<action>_response", requestId, status, data?|message?,
//! deduplicated?, existingRequestId?}`.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SessionId};

use super::action::{Action, Command, CommandParams};

// ============================================================================
// AutomationRequest
// ============================================================================

/// A command envelope received from an automation WebSocket client.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationRequest {
    /// Session issued during the handshake.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,

    /// Caller-chosen request ID; generated when absent.
    #[serde(rename = "requestId", default)]
    pub request_id: Option<RequestId>,

    /// Wire action name, validated against the closed set.
    pub action: String,

    /// Recognized parameters; unknown fields are ignored.
    #[serde(flatten)]
    pub params: CommandParams,
}

impl AutomationRequest {
    /// Parses a text frame into a request envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for malformed JSON.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("malformed request envelope: {e}")))
    }

    /// Resolves the wire action and validates parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAction`] or [`Error::InvalidArgument`].
    pub fn into_command(self) -> Result<(Option<SessionId>, Option<RequestId>, Command)> {
        let action = Action::parse(&self.action)?;
        let command = Command::new(action, self.params)?;
        Ok((self.session_id, self.request_id, command))
    }
}

// ============================================================================
// notify - Server → Client Builders
// ============================================================================

/// Builders for every message the gateway pushes to clients.
///
/// All builders return `serde_json::Value`; callers serialize once at the
/// socket boundary.
pub mod notify {
    use serde_json::{Value, json};

    use crate::identifiers::RequestId;

    use super::Action;

    /// Typed success response for a terminal result.
    #[must_use]
    pub fn success(action: Action, request_id: &RequestId, data: Value) -> Value {
        json!({
            "type": action.response_type(),
            "requestId": request_id,
            "status": "success",
            "data": data,
        })
    }

    /// Typed error response for a terminal failure.
    #[must_use]
    pub fn error(action: Action, request_id: &RequestId, message: &str) -> Value {
        json!({
            "type": action.response_type(),
            "requestId": request_id,
            "status": "error",
            "message": message,
        })
    }

    /// Acknowledgement that a command was registered and dispatched.
    #[must_use]
    pub fn pending(action: Action, request_id: &RequestId) -> Value {
        json!({
            "type": action.response_type(),
            "requestId": request_id,
            "status": "pending",
        })
    }

    /// Dedup response folding the call onto an in-flight request.
    #[must_use]
    pub fn deduplicated(action: Action, request_id: &RequestId, existing: &RequestId) -> Value {
        json!({
            "type": action.response_type(),
            "requestId": request_id,
            "status": "pending",
            "deduplicated": true,
            "existingRequestId": existing,
        })
    }

    /// Protocol-level error that does not disturb the connection.
    #[must_use]
    pub fn protocol_error(request_id: Option<&RequestId>, code: &str, message: &str) -> Value {
        match request_id {
            Some(id) => json!({
                "type": "error",
                "requestId": id,
                "code": code,
                "message": message,
            }),
            None => json!({
                "type": "error",
                "code": code,
                "message": message,
            }),
        }
    }

    /// Subscribed event push: `{type: "event", event, data}`.
    #[must_use]
    pub fn event(name: &str, data: Value) -> Value {
        json!({
            "type": "event",
            "event": name,
            "data": data,
        })
    }

    /// Application-level pong.
    #[must_use]
    pub fn pong() -> Value {
        json!({"type": "pong"})
    }

    /// Acknowledgement of an extension `init`, carrying server config.
    #[must_use]
    pub fn init_ack(
        request_timeout_ms: u64,
        heartbeat_interval_ms: u64,
        heartbeat_timeout_ms: u64,
        global_limit: usize,
        window_ms: u64,
    ) -> Value {
        json!({
            "type": "init_ack",
            "config": {
                "request": {"defaultTimeout": request_timeout_ms},
                "heartbeat": {
                    "interval": heartbeat_interval_ms,
                    "timeout": heartbeat_timeout_ms,
                },
                "rateLimit": {"limit": global_limit, "windowMs": window_ms},
            },
        })
    }

    /// Session-expiry warning with the remaining lifetime.
    #[must_use]
    pub fn session_expiring(expires_in_secs: u64) -> Value {
        json!({
            "type": "session_expiring",
            "expiresIn": expires_in_secs,
        })
    }

    /// Session-expired notice sent before the grace close.
    #[must_use]
    pub fn session_expired() -> Value {
        json!({"type": "session_expired"})
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::identifiers::TabId;

    #[test]
    fn test_parse_request_envelope() {
        let text = r#"{
            "sessionId": "550e8400-e29b-41d4-a716-446655440000",
            "requestId": "r1",
            "action": "open_url",
            "url": "https://example.org",
            "tabId": null
        }"#;

        let request = AutomationRequest::parse(text).expect("parse");
        assert_eq!(request.request_id, Some(RequestId::new("r1")));
        assert_eq!(request.action, "open_url");
        assert_eq!(request.params.url.as_deref(), Some("https://example.org"));
        assert_eq!(request.params.tab_id, None);

        let (session_id, request_id, command) = request.into_command().expect("command");
        assert!(session_id.is_some());
        assert_eq!(request_id, Some(RequestId::new("r1")));
        assert_eq!(command.action, Action::OpenUrl);
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = AutomationRequest::parse("{not json").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let text = r#"{"action": "reboot_browser"}"#;
        let request = AutomationRequest::parse(text).expect("parse");
        let err = request.into_command().unwrap_err();
        assert!(matches!(err, Error::UnknownAction { .. }));
    }

    #[test]
    fn test_request_without_ids() {
        let text = r#"{"action": "get_tabs"}"#;
        let request = AutomationRequest::parse(text).expect("parse");
        assert!(request.session_id.is_none());
        assert!(request.request_id.is_none());
    }

    #[test]
    fn test_success_response_shape() {
        let value = notify::success(
            Action::OpenUrl,
            &RequestId::new("r1"),
            serde_json::json!({"tabId": TabId::new(7)}),
        );
        assert_eq!(value["type"], "open_url_response");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["tabId"], 7);
    }

    #[test]
    fn test_dedup_response_shape() {
        let value = notify::deduplicated(
            Action::OpenUrl,
            &RequestId::new("r2"),
            &RequestId::new("r1"),
        );
        assert_eq!(value["status"], "pending");
        assert_eq!(value["deduplicated"], true);
        assert_eq!(value["existingRequestId"], "r1");
    }

    #[test]
    fn test_protocol_error_without_request() {
        let value = notify::protocol_error(None, "bad_frame", "malformed frame");
        assert_eq!(value["type"], "error");
        assert!(value.get("requestId").is_none());
    }

    #[test]
    fn test_event_shape() {
        let value = notify::event("tab_opened", serde_json::json!({"tabId": 7}));
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "tab_opened");
        assert_eq!(value["data"]["tabId"], 7);
    }

    #[test]
    fn test_init_ack_carries_config() {
        let value = notify::init_ack(60_000, 30_000, 90_000, 300, 60_000);
        assert_eq!(value["config"]["request"]["defaultTimeout"], 60_000);
        assert_eq!(value["config"]["heartbeat"]["interval"], 30_000);
        assert_eq!(value["config"]["rateLimit"]["limit"], 300);
    }
}
