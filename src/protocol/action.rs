//! The closed action set and command parameters.
//!
//! Every command flowing through the gateway is one of the variants
//! below; dispatch is a single exhaustive match. Sensitive actions are
//! subject to the tighter rate-limit window and are always audited.
//!
//! # Actions
//!
//! | Action | Dispatched to extension | Sensitive |
//! |--------|------------------------|-----------|
//! | `get_tabs` | no (served from snapshot) | no |
//! | `open_url` | yes | no |
//! | `close_tab` | yes | no |
//! | `get_html` | yes | no |
//! | `execute_script` | yes | yes |
//! | `inject_css` | yes | yes |
//! | `get_cookies` | yes | yes |
//! | `upload_file_to_tab` | yes | yes |
//! | `subscribe_events` | no | no |
//! | `unsubscribe_events` | no | no |

// ============================================================================
// Imports
// ============================================================================

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::identifiers::{RequestId, TabId};

// ============================================================================
// Action
// ============================================================================

/// The closed set of actions accepted from automation clients and the
/// HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Return the last known tab snapshot.
    GetTabs,
    /// Open a URL, optionally in an existing tab.
    OpenUrl,
    /// Close a tab.
    CloseTab,
    /// Fetch a tab's HTML (streamed back in chunks).
    GetHtml,
    /// Execute JavaScript in a tab.
    ExecuteScript,
    /// Inject CSS into a tab.
    InjectCss,
    /// Read cookies visible to a tab.
    GetCookies,
    /// Upload a file into a tab's file input.
    UploadFileToTab,
    /// Subscribe the connection to event names.
    SubscribeEvents,
    /// Unsubscribe the connection from event names.
    UnsubscribeEvents,
}

impl Action {
    /// Returns the wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetTabs => "get_tabs",
            Self::OpenUrl => "open_url",
            Self::CloseTab => "close_tab",
            Self::GetHtml => "get_html",
            Self::ExecuteScript => "execute_script",
            Self::InjectCss => "inject_css",
            Self::GetCookies => "get_cookies",
            Self::UploadFileToTab => "upload_file_to_tab",
            Self::SubscribeEvents => "subscribe_events",
            Self::UnsubscribeEvents => "unsubscribe_events",
        }
    }

    /// Parses a wire action name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAction`] for names outside the closed set.
    pub fn parse(name: &str) -> Result<Self> {
        serde_json::from_value(Value::String(name.to_string()))
            .map_err(|_| Error::unknown_action(name))
    }

    /// Returns `true` if the action is dispatched to an extension.
    ///
    /// `get_tabs` is answered from the gateway's last snapshot;
    /// subscriptions are connection-local.
    #[inline]
    #[must_use]
    pub const fn is_command(self) -> bool {
        !matches!(
            self,
            Self::GetTabs | Self::SubscribeEvents | Self::UnsubscribeEvents
        )
    }

    /// Returns `true` if the action counts against the sensitive window.
    #[inline]
    #[must_use]
    pub const fn is_sensitive(self) -> bool {
        matches!(
            self,
            Self::ExecuteScript | Self::InjectCss | Self::GetCookies | Self::UploadFileToTab
        )
    }

    /// Returns the `type` of the response envelope for this action.
    #[must_use]
    pub fn response_type(self) -> String {
        format!("{}_response", self.as_str())
    }

    /// Returns the `type` of the extension completion for this action,
    /// if the action is dispatched.
    #[must_use]
    pub fn complete_type(self) -> Option<String> {
        self.is_command().then(|| match self {
            // HTML arrives as chunks followed by a dedicated completion.
            Self::GetHtml => "tab_html_complete".to_string(),
            other => format!("{}_complete", other.as_str()),
        })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CommandParams
// ============================================================================

/// Recognized command parameters.
///
/// Every action reads a narrow projection of these; unknown wire fields
/// are ignored on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    /// Target tab (`null` targets the active tab).
    #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,

    /// URL for `open_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// JavaScript source for `execute_script`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Stylesheet for `inject_css`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,

    /// Target window for `open_url`.
    #[serde(rename = "windowId", default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<i64>,

    /// Cookie domain filter for `get_cookies`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Cookie name filter for `get_cookies`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// File name for `upload_file_to_tab`.
    #[serde(rename = "fileName", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// File content for `upload_file_to_tab`.
    #[serde(rename = "fileContent", default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,

    /// Event names for `subscribe_events` / `unsubscribe_events`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
}

// ============================================================================
// Command
// ============================================================================

/// A validated command: action plus parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// The action to perform.
    pub action: Action,
    /// Recognized parameters.
    pub params: CommandParams,
}

impl Command {
    /// Creates a command and validates its required parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when a required parameter for
    /// the action is missing.
    pub fn new(action: Action, params: CommandParams) -> Result<Self> {
        let command = Self { action, params };
        command.validate()?;
        Ok(command)
    }

    /// Validates required parameters per action.
    fn validate(&self) -> Result<()> {
        match self.action {
            Action::OpenUrl if self.params.url.is_none() => {
                Err(Error::invalid_argument("open_url requires url"))
            }
            Action::CloseTab if self.params.tab_id.is_none() => {
                Err(Error::invalid_argument("close_tab requires tabId"))
            }
            Action::ExecuteScript if self.params.code.is_none() => {
                Err(Error::invalid_argument("execute_script requires code"))
            }
            Action::InjectCss if self.params.css.is_none() => {
                Err(Error::invalid_argument("inject_css requires css"))
            }
            Action::UploadFileToTab if self.params.file_content.is_none() => {
                Err(Error::invalid_argument("upload_file_to_tab requires fileContent"))
            }
            Action::SubscribeEvents | Action::UnsubscribeEvents
                if self.params.events.as_ref().is_none_or(Vec::is_empty) =>
            {
                Err(Error::invalid_argument("subscription requires events"))
            }
            _ => Ok(()),
        }
    }

    /// Builds the dedup key for this command, if the action dedups.
    ///
    /// The key projects only the fields that make two commands
    /// observably identical:
    ///
    /// - `open_url`: URL + tab
    /// - `execute_script`: tab + hash of the code
    /// - `close_tab` / `get_html` / `get_cookies`: tab alone
    #[must_use]
    pub fn dedup_key(&self) -> Option<String> {
        let tab = |t: Option<TabId>| {
            t.map_or_else(|| "null".to_string(), |id| id.as_i64().to_string())
        };

        match self.action {
            Action::OpenUrl => {
                let url = self.params.url.as_deref().unwrap_or_default();
                Some(format!("open_url:{}:{}", url, tab(self.params.tab_id)))
            }
            Action::ExecuteScript => {
                let mut hasher = FxHasher::default();
                self.params.code.as_deref().unwrap_or_default().hash(&mut hasher);
                Some(format!(
                    "execute_script:{}:{:016x}",
                    tab(self.params.tab_id),
                    hasher.finish()
                ))
            }
            Action::CloseTab => Some(format!("close_tab:{}", tab(self.params.tab_id))),
            Action::GetHtml => Some(format!("get_html:{}", tab(self.params.tab_id))),
            Action::GetCookies => Some(format!("get_cookies:{}", tab(self.params.tab_id))),
            _ => None,
        }
    }

    /// Serializes the command envelope sent to an extension:
    /// `{type, …params, requestId}`.
    #[must_use]
    pub fn envelope(&self, request_id: &RequestId) -> Value {
        let mut fields = match serde_json::to_value(&self.params) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        fields.insert("type".to_string(), json!(self.action.as_str()));
        fields.insert("requestId".to_string(), json!(request_id));
        Value::Object(fields)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_names() {
        assert_eq!(Action::OpenUrl.as_str(), "open_url");
        assert_eq!(Action::parse("execute_script").expect("parse"), Action::ExecuteScript);
        assert!(matches!(
            Action::parse("launch_missiles"),
            Err(Error::UnknownAction { .. })
        ));
    }

    #[test]
    fn test_sensitive_subset() {
        assert!(Action::ExecuteScript.is_sensitive());
        assert!(Action::GetCookies.is_sensitive());
        assert!(Action::InjectCss.is_sensitive());
        assert!(Action::UploadFileToTab.is_sensitive());
        assert!(!Action::OpenUrl.is_sensitive());
        assert!(!Action::GetTabs.is_sensitive());
    }

    #[test]
    fn test_command_vs_local_actions() {
        assert!(Action::OpenUrl.is_command());
        assert!(Action::GetHtml.is_command());
        assert!(!Action::GetTabs.is_command());
        assert!(!Action::SubscribeEvents.is_command());
    }

    #[test]
    fn test_response_and_complete_types() {
        assert_eq!(Action::OpenUrl.response_type(), "open_url_response");
        assert_eq!(
            Action::OpenUrl.complete_type().as_deref(),
            Some("open_url_complete")
        );
        assert_eq!(
            Action::GetHtml.complete_type().as_deref(),
            Some("tab_html_complete")
        );
        assert_eq!(Action::GetTabs.complete_type(), None);
    }

    #[test]
    fn test_validation_missing_url() {
        let err = Command::new(Action::OpenUrl, CommandParams::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_validation_subscription_needs_events() {
        let err = Command::new(Action::SubscribeEvents, CommandParams::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        let ok = Command::new(
            Action::SubscribeEvents,
            CommandParams {
                events: Some(vec!["tab_opened".to_string()]),
                ..CommandParams::default()
            },
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_dedup_key_open_url() {
        let command = Command::new(
            Action::OpenUrl,
            CommandParams {
                url: Some("https://example.org".to_string()),
                ..CommandParams::default()
            },
        )
        .expect("command");

        assert_eq!(
            command.dedup_key().as_deref(),
            Some("open_url:https://example.org:null")
        );
    }

    #[test]
    fn test_dedup_key_script_hashes_code() {
        let make = |code: &str| {
            Command::new(
                Action::ExecuteScript,
                CommandParams {
                    tab_id: Some(TabId::new(7)),
                    code: Some(code.to_string()),
                    ..CommandParams::default()
                },
            )
            .expect("command")
        };

        let a = make("1 + 1").dedup_key().expect("key");
        let b = make("1 + 1").dedup_key().expect("key");
        let c = make("2 + 2").dedup_key().expect("key");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("execute_script:7:"));
    }

    #[test]
    fn test_dedup_key_tab_only_actions() {
        let command = Command::new(
            Action::GetHtml,
            CommandParams {
                tab_id: Some(TabId::new(3)),
                ..CommandParams::default()
            },
        )
        .expect("command");
        assert_eq!(command.dedup_key().as_deref(), Some("get_html:3"));
    }

    #[test]
    fn test_no_dedup_for_subscriptions() {
        let command = Command::new(
            Action::UnsubscribeEvents,
            CommandParams {
                events: Some(vec!["init".to_string()]),
                ..CommandParams::default()
            },
        )
        .expect("command");
        assert_eq!(command.dedup_key(), None);
    }

    #[test]
    fn test_envelope_shape() {
        let command = Command::new(
            Action::OpenUrl,
            CommandParams {
                url: Some("https://example.org".to_string()),
                tab_id: Some(TabId::new(4)),
                ..CommandParams::default()
            },
        )
        .expect("command");

        let envelope = command.envelope(&RequestId::new("r1"));
        assert_eq!(envelope["type"], "open_url");
        assert_eq!(envelope["url"], "https://example.org");
        assert_eq!(envelope["tabId"], 4);
        assert_eq!(envelope["requestId"], "r1");
        // Unset params never appear on the wire.
        assert!(envelope.get("code").is_none());
    }

    #[test]
    fn test_params_ignore_unknown_fields() {
        let params: CommandParams = serde_json::from_str(
            r#"{"url": "https://example.org", "futureField": 42}"#,
        )
        .expect("parse");
        assert_eq!(params.url.as_deref(), Some("https://example.org"));
    }
}
