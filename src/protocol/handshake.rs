//! Auth handshake message types.
//!
//! Three messages complete the admission handshake:
//!
//! ```text
//! gateway ── auth_challenge {challenge, timestamp, serverVersion} ──▶ client
//! client ── auth_response {response, clientId?} ──▶ gateway
//! gateway ── auth_result {success, sessionId?, …} ──▶ client
//! ```
//!
//! The challenge is 16 random bytes as hex; the response is
//! `HMAC-SHA256(secret, challenge)` as hex (64 chars).

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

// ============================================================================
// AuthChallenge
// ============================================================================

/// Server → client: the fresh challenge to sign.
#[derive(Debug, Clone, Serialize)]
pub struct AuthChallenge {
    /// Message type marker.
    #[serde(rename = "type")]
    pub message_type: &'static str,

    /// 16 random bytes, hex-encoded.
    pub challenge: String,

    /// Milliseconds since the Unix epoch at issuance.
    pub timestamp: u64,

    /// Gateway version string.
    #[serde(rename = "serverVersion")]
    pub server_version: &'static str,
}

impl AuthChallenge {
    /// Creates a challenge message stamped with the current time.
    #[must_use]
    pub fn new(challenge: String, server_version: &'static str) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            message_type: "auth_challenge",
            challenge,
            timestamp,
            server_version,
        }
    }
}

// ============================================================================
// AuthResponse
// ============================================================================

/// Client → server: the HMAC over the challenge.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    /// Hex-encoded HMAC-SHA256 digest (64 chars when well-formed).
    pub response: String,

    /// Caller-chosen identity for rate limiting and auditing.
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
}

impl AuthResponse {
    /// Parses a text frame as an `auth_response`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the frame is not an
    /// `auth_response` or is malformed.
    pub fn parse(text: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "type")]
            message_type: String,
            #[serde(flatten)]
            inner: AuthResponse,
        }

        let tagged: Tagged = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("malformed auth_response: {e}")))?;

        if tagged.message_type != "auth_response" {
            return Err(Error::protocol(format!(
                "expected auth_response, got {}",
                tagged.message_type
            )));
        }

        Ok(tagged.inner)
    }
}

// ============================================================================
// AuthResult
// ============================================================================

/// Server → client: the handshake outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    /// Message type marker.
    #[serde(rename = "type")]
    pub message_type: &'static str,

    /// Whether admission was granted.
    pub success: bool,

    /// Issued session on success.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Session lifetime in seconds on success.
    #[serde(rename = "expiresIn", skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Granted permission set on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<&'static str>>,

    /// Failure description on rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Seconds before another attempt is worthwhile, on rejection.
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl AuthResult {
    /// Builds a success result.
    #[must_use]
    pub fn granted(
        session_id: SessionId,
        expires_in_secs: u64,
        permissions: Vec<&'static str>,
    ) -> Self {
        Self {
            message_type: "auth_result",
            success: true,
            session_id: Some(session_id),
            expires_in: Some(expires_in_secs),
            permissions: Some(permissions),
            error: None,
            retry_after: None,
        }
    }

    /// Builds a rejection result.
    #[must_use]
    pub fn rejected(error: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self {
            message_type: "auth_result",
            success: false,
            session_id: None,
            expires_in: None,
            permissions: None,
            error: Some(error.into()),
            retry_after,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_serialization() {
        let challenge = AuthChallenge::new("a1b2c3d4e5f60718293a4b5c6d7e8f90".to_string(), "0.1.0");
        let value = serde_json::to_value(&challenge).expect("serialize");

        assert_eq!(value["type"], "auth_challenge");
        assert_eq!(value["challenge"], "a1b2c3d4e5f60718293a4b5c6d7e8f90");
        assert_eq!(value["serverVersion"], "0.1.0");
        assert!(value["timestamp"].as_u64().expect("ts") > 0);
    }

    #[test]
    fn test_response_parse() {
        let text = r#"{"type": "auth_response", "response": "ab12", "clientId": "bot-1"}"#;
        let response = AuthResponse::parse(text).expect("parse");
        assert_eq!(response.response, "ab12");
        assert_eq!(response.client_id.as_deref(), Some("bot-1"));
    }

    #[test]
    fn test_response_parse_wrong_type() {
        let text = r#"{"type": "hello", "response": "ab12"}"#;
        let err = AuthResponse::parse(text).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_response_parse_missing_field() {
        let err = AuthResponse::parse(r#"{"type": "auth_response"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_result_granted_shape() {
        let session_id = SessionId::generate();
        let result = AuthResult::granted(session_id, 3600, vec!["open_url", "get_html"]);
        let value = serde_json::to_value(&result).expect("serialize");

        assert_eq!(value["type"], "auth_result");
        assert_eq!(value["success"], true);
        assert_eq!(value["expiresIn"], 3600);
        assert_eq!(value["sessionId"], session_id.to_string());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_result_rejected_shape() {
        let result = AuthResult::rejected("Authentication failed", Some(30));
        let value = serde_json::to_value(&result).expect("serialize");

        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Authentication failed");
        assert_eq!(value["retryAfter"], 30);
        assert!(value.get("sessionId").is_none());
    }
}
