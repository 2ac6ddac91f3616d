//! Error types for the browser gateway.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use browser_gateway::{Result, Error};
//!
//! async fn example(correlator: &Correlator) -> Result<()> {
//!     let outcome = correlator.submit(command, delivery).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::Secret`] |
//! | Admission | [`Error::OriginRejected`], [`Error::AddressLocked`], [`Error::AtCapacity`], [`Error::RateLimited`], [`Error::PendingLimit`] |
//! | Auth | [`Error::AuthFailed`], [`Error::ChallengeExpired`], [`Error::SessionExpired`] |
//! | Protocol | [`Error::UnknownAction`], [`Error::InvalidArgument`], [`Error::Protocol`] |
//! | Dispatch | [`Error::NoExtensions`], [`Error::RequestTimeout`], [`Error::RequestNotFound`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::ShuttingDown`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{RequestId, SessionId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging and for mapping
/// to wire-level outcomes (WebSocket close codes, HTTP statuses).
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when gateway configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Shared-secret discovery or key-file error.
    #[error("Secret error: {message}")]
    Secret {
        /// Description of the secret error.
        message: String,
    },

    // ========================================================================
    // Admission Errors
    // ========================================================================
    /// Origin header failed the whitelist check.
    #[error("Origin not allowed: {origin}")]
    OriginRejected {
        /// The rejected origin value ("null" for absent origins).
        origin: String,
    },

    /// Remote address is locked out after repeated auth failures.
    #[error("Address locked, retry after {retry_after_secs}s")]
    AddressLocked {
        /// Seconds until the lock expires.
        retry_after_secs: u64,
    },

    /// Extension slots are exhausted.
    #[error("Extension capacity reached: {active}/{max}")]
    AtCapacity {
        /// Currently admitted extensions.
        active: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A sliding-window rate limit rejected the caller.
    #[error("Rate limit exceeded ({scope}), retry after {retry_after_secs}s")]
    RateLimited {
        /// Which window rejected: "global", "sensitive", or "poll".
        scope: &'static str,
        /// Seconds until the oldest event leaves the window.
        retry_after_secs: u64,
    },

    /// Pending-request table is full.
    #[error("Too many pending requests: {pending}/{max}")]
    PendingLimit {
        /// Current pending count.
        pending: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========================================================================
    // Auth Errors
    // ========================================================================
    /// Challenge/response verification failed.
    #[error("Authentication failed: {message}")]
    AuthFailed {
        /// Description of the failure.
        message: String,
    },

    /// Challenge expired or was already consumed.
    #[error("Challenge expired")]
    ChallengeExpired,

    /// Session is absent or past its TTL.
    #[error("Session expired: {session_id}")]
    SessionExpired {
        /// The expired session's ID.
        session_id: SessionId,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Unknown action name.
    #[error("Unknown action: {action}")]
    UnknownAction {
        /// The unrecognized action name.
        action: String,
    },

    /// Missing or invalid parameter in a command.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Protocol violation or malformed frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// No extension connection could accept the command.
    #[error("no active browser extension connections")]
    NoExtensions,

    /// Command timed out waiting for the extension reply.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// No pending or retained entry for the request ID.
    #[error("Request not found: {request_id}")]
    RequestNotFound {
        /// The missing request ID.
        request_id: RequestId,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// WebSocket connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Gateway is shutting down; no new work accepted.
    #[error("Server shutting down")]
    ShuttingDown,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a secret error.
    #[inline]
    pub fn secret(message: impl Into<String>) -> Self {
        Self::Secret {
            message: message.into(),
        }
    }

    /// Creates an origin rejection error.
    #[inline]
    pub fn origin_rejected(origin: impl Into<String>) -> Self {
        Self::OriginRejected {
            origin: origin.into(),
        }
    }

    /// Creates an address-locked error.
    #[inline]
    pub fn address_locked(retry_after_secs: u64) -> Self {
        Self::AddressLocked { retry_after_secs }
    }

    /// Creates a capacity error.
    #[inline]
    pub fn at_capacity(active: usize, max: usize) -> Self {
        Self::AtCapacity { active, max }
    }

    /// Creates a rate-limit error.
    #[inline]
    pub fn rate_limited(scope: &'static str, retry_after_secs: u64) -> Self {
        Self::RateLimited {
            scope,
            retry_after_secs,
        }
    }

    /// Creates a pending-limit error.
    #[inline]
    pub fn pending_limit(pending: usize, max: usize) -> Self {
        Self::PendingLimit { pending, max }
    }

    /// Creates an auth failure error.
    #[inline]
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    /// Creates a session-expired error.
    #[inline]
    pub fn session_expired(session_id: SessionId) -> Self {
        Self::SessionExpired { session_id }
    }

    /// Creates an unknown-action error.
    #[inline]
    pub fn unknown_action(action: impl Into<String>) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a request-not-found error.
    #[inline]
    pub fn request_not_found(request_id: RequestId) -> Self {
        Self::RequestNotFound { request_id }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if this is an admission error (origin, lock,
    /// capacity, rate limit, pending limit).
    #[inline]
    #[must_use]
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::OriginRejected { .. }
                | Self::AddressLocked { .. }
                | Self::AtCapacity { .. }
                | Self::RateLimited { .. }
                | Self::PendingLimit { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_)
        )
    }

    /// Returns the WebSocket close code this error maps to, if any.
    ///
    /// | Code | Errors |
    /// |------|--------|
    /// | 1008 | origin, lock, auth, session |
    /// | 1013 | capacity |
    /// | 1000 | shutdown |
    #[inline]
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::OriginRejected { .. }
            | Self::AddressLocked { .. }
            | Self::AuthFailed { .. }
            | Self::ChallengeExpired
            | Self::SessionExpired { .. } => Some(1008),
            Self::AtCapacity { .. } => Some(1013),
            Self::ShuttingDown => Some(1000),
            _ => None,
        }
    }

    /// Returns the retry delay this error advertises, in seconds.
    #[inline]
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::AddressLocked { retry_after_secs }
            | Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            Self::PendingLimit { .. } => Some(5),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("upgrade failed");
        assert_eq!(err.to_string(), "Connection failed: upgrade failed");
    }

    #[test]
    fn test_no_extensions_message() {
        // Exact wire message returned when the extension set is exhausted.
        assert_eq!(
            Error::NoExtensions.to_string(),
            "no active browser extension connections"
        );
    }

    #[test]
    fn test_timeout_message_format() {
        let err = Error::request_timeout(RequestId::new("r1"), 60000);
        assert_eq!(err.to_string(), "Request r1 timed out after 60000ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_is_admission_error() {
        assert!(Error::origin_rejected("http://evil.example").is_admission_error());
        assert!(Error::address_locked(30).is_admission_error());
        assert!(Error::at_capacity(5, 5).is_admission_error());
        assert!(Error::rate_limited("global", 12).is_admission_error());
        assert!(Error::pending_limit(100, 100).is_admission_error());
        assert!(!Error::ConnectionClosed.is_admission_error());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(Error::origin_rejected("x").close_code(), Some(1008));
        assert_eq!(Error::address_locked(10).close_code(), Some(1008));
        assert_eq!(Error::auth_failed("bad hmac").close_code(), Some(1008));
        assert_eq!(Error::at_capacity(5, 5).close_code(), Some(1013));
        assert_eq!(Error::ShuttingDown.close_code(), Some(1000));
        assert_eq!(Error::NoExtensions.close_code(), None);
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(Error::address_locked(42).retry_after(), Some(42));
        assert_eq!(Error::rate_limited("sensitive", 9).retry_after(), Some(9));
        assert_eq!(Error::pending_limit(10, 10).retry_after(), Some(5));
        assert_eq!(Error::ConnectionClosed.retry_after(), None);
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
