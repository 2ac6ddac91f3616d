//! Extension inbound message types.
//!
//! Extensions speak two carrier shapes:
//!
//! - bare typed messages: `{type, requestId, …}`
//! - wrapped envelopes: `{type: "request"|"notification", action,
//!   requestId?, sessionId?, payload}`
//!
//! [`ExtensionMessage::parse`] normalizes the wrapped shape to the bare
//! one before typed dispatch, so the rest of the gateway sees a single
//! message family.
//!
//! # Message Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | `ping` | Answered with `pong` |
//! | `init` | Triggers a single `init_ack` with server config |
//! | `data` | Tab snapshot `{tabs, active_tab_id}` |
//! | `*_complete` | Terminal reply for a dispatched command |
//! | `tab_html_chunk` | Intermediate HTML chunk |
//! | `error` | Terminal error for a dispatched command |

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::{RequestId, SessionId};

use super::action::Action;

// ============================================================================
// CompletionPayload
// ============================================================================

/// Shared shape of every `*_complete` message.
///
/// Unrecognized fields (tab data, cookies, script results) ride along in
/// `data` and are forwarded verbatim to the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionPayload {
    /// Request being completed.
    #[serde(rename = "requestId", alias = "request_id", default)]
    pub request_id: Option<RequestId>,

    /// Session the extension believes it holds.
    #[serde(rename = "sessionId", alias = "session_id", default)]
    pub session_id: Option<SessionId>,

    /// Action-specific result fields.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl CompletionPayload {
    /// Returns the result fields as a JSON object.
    #[inline]
    #[must_use]
    pub fn into_data(self) -> Value {
        Value::Object(self.data)
    }
}

// ============================================================================
// ExtensionMessage
// ============================================================================

/// Every message the gateway accepts from an extension connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionMessage {
    /// Liveness probe; answered with `pong`.
    Ping,

    /// Peer's answer to an application-level ping.
    Pong,

    /// Announce message after admission; answered once with `init_ack`.
    Init(CompletionPayload),

    /// Tab snapshot push.
    Data {
        /// Current tabs as reported by the browser.
        #[serde(default)]
        tabs: Value,
        /// Currently focused tab.
        #[serde(rename = "active_tab_id", alias = "activeTabId", default)]
        active_tab_id: Option<i64>,
    },

    /// Terminal reply for `open_url`.
    OpenUrlComplete(CompletionPayload),

    /// Terminal reply for `close_tab`.
    CloseTabComplete(CompletionPayload),

    /// Intermediate HTML chunk for `get_html`.
    TabHtmlChunk {
        /// Request the chunk belongs to.
        #[serde(rename = "requestId", alias = "request_id")]
        request_id: RequestId,
        /// Zero-based position of this chunk.
        chunk_index: usize,
        /// Chunk content.
        chunk_data: String,
        /// Total chunk count, when the extension knows it upfront.
        #[serde(default)]
        total_chunks: Option<usize>,
    },

    /// Terminal reply for `get_html`; ends chunk accumulation.
    TabHtmlComplete(CompletionPayload),

    /// Terminal reply for `execute_script`.
    ExecuteScriptComplete(CompletionPayload),

    /// Terminal reply for `inject_css`.
    InjectCssComplete(CompletionPayload),

    /// Terminal reply for `get_cookies`.
    GetCookiesComplete(CompletionPayload),

    /// Terminal reply for `upload_file_to_tab`.
    UploadFileToTabComplete(CompletionPayload),

    /// Terminal error for a dispatched command.
    Error {
        /// Request the error belongs to, when correlated.
        #[serde(rename = "requestId", alias = "request_id", default)]
        request_id: Option<RequestId>,
        /// Extension-provided message.
        #[serde(default)]
        message: String,
        /// Optional machine-readable code.
        #[serde(default)]
        code: Option<String>,
    },
}

impl ExtensionMessage {
    /// Parses a text frame, unwrapping the wrapped carrier shape first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for malformed JSON or unknown types.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("malformed frame: {e}")))?;
        let bare = unwrap_envelope(value);
        serde_json::from_value(bare)
            .map_err(|e| Error::protocol(format!("unrecognized extension message: {e}")))
    }

    /// Returns the request ID this message correlates to, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::OpenUrlComplete(p)
            | Self::CloseTabComplete(p)
            | Self::TabHtmlComplete(p)
            | Self::ExecuteScriptComplete(p)
            | Self::InjectCssComplete(p)
            | Self::GetCookiesComplete(p)
            | Self::UploadFileToTabComplete(p)
            | Self::Init(p) => p.request_id.as_ref(),
            Self::TabHtmlChunk { request_id, .. } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_ref(),
            _ => None,
        }
    }

    /// Returns the session ID the message carries, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::OpenUrlComplete(p)
            | Self::CloseTabComplete(p)
            | Self::TabHtmlComplete(p)
            | Self::ExecuteScriptComplete(p)
            | Self::InjectCssComplete(p)
            | Self::GetCookiesComplete(p)
            | Self::UploadFileToTabComplete(p)
            | Self::Init(p) => p.session_id,
            _ => None,
        }
    }

    /// Returns the action a completion message terminates, if this is one.
    #[must_use]
    pub fn completion_action(&self) -> Option<Action> {
        match self {
            Self::OpenUrlComplete(_) => Some(Action::OpenUrl),
            Self::CloseTabComplete(_) => Some(Action::CloseTab),
            Self::TabHtmlComplete(_) => Some(Action::GetHtml),
            Self::ExecuteScriptComplete(_) => Some(Action::ExecuteScript),
            Self::InjectCssComplete(_) => Some(Action::InjectCss),
            Self::GetCookiesComplete(_) => Some(Action::GetCookies),
            Self::UploadFileToTabComplete(_) => Some(Action::UploadFileToTab),
            _ => None,
        }
    }

    /// Returns `true` for `*_complete` follow-ups and chunks.
    ///
    /// These are silently dropped (not bounced with `session_expired`)
    /// when their session is invalid, to avoid breaking a request chain
    /// already in flight.
    #[must_use]
    pub fn is_completion_shaped(&self) -> bool {
        self.completion_action().is_some() || matches!(self, Self::TabHtmlChunk { .. })
    }
}

// ============================================================================
// Carrier Unwrapping
// ============================================================================

/// Normalizes the wrapped carrier shape to the bare typed shape.
///
/// `{type: "request"|"notification", action, requestId?, sessionId?,
/// payload}` becomes `{type: action, …payload, requestId?, sessionId?}`.
/// Any other value passes through unchanged.
#[must_use]
fn unwrap_envelope(value: Value) -> Value {
    let Value::Object(ref outer) = value else {
        return value;
    };

    let is_wrapped = matches!(
        outer.get("type").and_then(Value::as_str),
        Some("request" | "notification")
    );
    if !is_wrapped {
        return value;
    }

    let Some(action) = outer.get("action").and_then(Value::as_str) else {
        return value;
    };

    let mut bare = match outer.get("payload") {
        Some(Value::Object(payload)) => payload.clone(),
        _ => Map::new(),
    };
    bare.insert("type".to_string(), Value::String(action.to_string()));

    for key in ["requestId", "sessionId"] {
        if let Some(v) = outer.get(key) {
            if !v.is_null() {
                bare.entry(key.to_string()).or_insert_with(|| v.clone());
            }
        }
    }

    Value::Object(bare)
}

// ============================================================================
// Tests
// ============================================================================
