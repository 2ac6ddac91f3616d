//! Gateway configuration.
//!
//! Provides a type-safe configuration surface for the gateway: bind
//! addresses, auth and origin policy, heartbeat cadence, request-lifecycle
//! timeouts, and rate-limit windows. Loading configuration from files is an
//! external concern; this crate only consumes the typed struct.
//!
//! # Example
//!
//! ```ignore
//! use browser_gateway::GatewayConfig;
//!
//! let config = GatewayConfig::new()
//!     .with_max_clients(3)
//!     .with_request_timeout_ms(30_000)
//!     .with_allowed_origin("moz-extension://");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Version string advertised in `auth_challenge` and `init_ack`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default WebSocket bind address.
const DEFAULT_WS_BIND: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8765);

/// Default HTTP bind address.
const DEFAULT_HTTP_BIND: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8766);

// ============================================================================
// RateLimitConfig
// ============================================================================

/// Sliding-window limits applied per caller, per address, and per request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Max events per caller in the global window.
    pub global_limit: usize,

    /// Max sensitive-action events per caller in the window.
    pub sensitive_limit: usize,

    /// Window length for the global and sensitive counters.
    pub window: Duration,

    /// Auth failures from one address before it is locked.
    pub max_failed_attempts: usize,

    /// Window length for the auth-failure counter.
    pub failure_window: Duration,

    /// How long a locked address stays locked.
    pub lockout_duration: Duration,

    /// Max callback polls per caller in the poll window.
    pub poll_limit: usize,

    /// Window length for the poll counter.
    pub poll_window: Duration,

    /// Hard ceiling of polls for a single request ID.
    pub max_polls_per_request: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_limit: 300,
            sensitive_limit: 30,
            window: Duration::from_secs(60),
            max_failed_attempts: 5,
            failure_window: Duration::from_secs(60),
            lockout_duration: Duration::from_secs(300),
            poll_limit: 60,
            poll_window: Duration::from_secs(60),
            max_polls_per_request: 60,
        }
    }
}

// ============================================================================
// GatewayConfig
// ============================================================================

/// Complete gateway configuration with defaults for every knob.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    // ------------------------------------------------------------------
    // Binds
    // ------------------------------------------------------------------
    /// WebSocket listener address (port 0 for ephemeral).
    pub ws_bind: SocketAddr,

    /// HTTP listener address (port 0 for ephemeral).
    pub http_bind: SocketAddr,

    // ------------------------------------------------------------------
    // Origin policy
    // ------------------------------------------------------------------
    /// Reject WS upgrades whose Origin matches no whitelist prefix.
    pub strict_origin: bool,

    /// Origin prefixes accepted during the WS upgrade. `*` accepts any.
    pub allowed_origins: Vec<String>,

    /// Accept connections that carry no Origin header.
    pub allow_null_origin: bool,

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------
    /// Run the challenge/response handshake before admission.
    pub auth_enabled: bool,

    /// Explicit shared secret (hex). Overridden by the env var, falls
    /// back to the key file when absent.
    pub secret: Option<String>,

    /// Path of the on-disk key file (created mode 0600 when generated).
    pub key_file: PathBuf,

    /// How long a pre-auth connection may take to answer the challenge.
    pub challenge_timeout: Duration,

    /// Session lifetime from creation; not renewed by activity.
    pub session_ttl: Duration,

    /// Lead time for the single `session_expiring` warning.
    pub session_expiry_warning: Duration,

    // ------------------------------------------------------------------
    // Capacity
    // ------------------------------------------------------------------
    /// Max simultaneously admitted extension connections.
    pub max_clients: usize,

    /// Max pending requests across the gateway.
    pub max_pending_responses: usize,

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------
    /// Interval between WS pings to admitted connections.
    pub heartbeat_interval: Duration,

    /// Silence after the last pong before the connection is closed (1001).
    pub heartbeat_timeout: Duration,

    // ------------------------------------------------------------------
    // Request lifecycle
    // ------------------------------------------------------------------
    /// Default TTL for a dispatched command.
    pub request_timeout: Duration,

    /// Window during which an identical command folds onto the in-flight one.
    pub dedup_window: Duration,

    /// How long terminal results stay pollable.
    pub response_retention: Duration,

    /// Cadence of the pending-request timeout sweep.
    pub timeout_check_interval: Duration,

    /// Cadence of the terminal-entry retention sweep.
    pub cleanup_interval: Duration,

    /// Upper bound on a single long-poll wait.
    pub max_wait_time: Duration,

    /// Delivery timeout for HTTP callback POSTs.
    pub callback_delivery_timeout: Duration,

    // ------------------------------------------------------------------
    // Monitor
    // ------------------------------------------------------------------
    /// Cadence of the resource-monitor health check.
    pub health_check_interval: Duration,

    /// Pending-usage fraction at which status degrades to warning.
    pub warning_threshold: f64,

    // ------------------------------------------------------------------
    // Rate limits
    // ------------------------------------------------------------------
    /// Sliding-window limits.
    pub rate: RateLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_bind: DEFAULT_WS_BIND,
            http_bind: DEFAULT_HTTP_BIND,
            strict_origin: true,
            allowed_origins: vec![
                "moz-extension://".to_string(),
                "chrome-extension://".to_string(),
                "http://localhost".to_string(),
                "http://127.0.0.1".to_string(),
            ],
            allow_null_origin: true,
            auth_enabled: true,
            secret: None,
            key_file: PathBuf::from(".gateway-key"),
            challenge_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(3600),
            session_expiry_warning: Duration::from_secs(300),
            max_clients: 5,
            max_pending_responses: 100,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(60),
            dedup_window: Duration::from_secs(5),
            response_retention: Duration::from_secs(300),
            timeout_check_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            max_wait_time: Duration::from_secs(30),
            callback_delivery_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            warning_threshold: 0.8,
            rate: RateLimitConfig::default(),
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl GatewayConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration suited to tests: ephemeral ports, auth on,
    /// tight timers.
    #[inline]
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            ws_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            http_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            challenge_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_secs(2),
            timeout_check_interval: Duration::from_millis(100),
            cleanup_interval: Duration::from_millis(500),
            health_check_interval: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl GatewayConfig {
    /// Sets the WebSocket bind address.
    #[inline]
    #[must_use]
    pub fn with_ws_bind(mut self, addr: SocketAddr) -> Self {
        self.ws_bind = addr;
        self
    }

    /// Sets the HTTP bind address.
    #[inline]
    #[must_use]
    pub fn with_http_bind(mut self, addr: SocketAddr) -> Self {
        self.http_bind = addr;
        self
    }

    /// Disables the auth handshake (connections admit immediately).
    #[inline]
    #[must_use]
    pub fn without_auth(mut self) -> Self {
        self.auth_enabled = false;
        self
    }

    /// Sets the explicit shared secret (hex).
    #[inline]
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Sets the key-file path used for secret discovery.
    #[inline]
    #[must_use]
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = path.into();
        self
    }

    /// Appends an allowed origin prefix.
    #[inline]
    #[must_use]
    pub fn with_allowed_origin(mut self, prefix: impl Into<String>) -> Self {
        self.allowed_origins.push(prefix.into());
        self
    }

    /// Disables strict origin checking.
    #[inline]
    #[must_use]
    pub fn without_strict_origin(mut self) -> Self {
        self.strict_origin = false;
        self
    }

    /// Sets the maximum number of admitted extensions.
    #[inline]
    #[must_use]
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Sets the default request timeout in milliseconds.
    #[inline]
    #[must_use]
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout = Duration::from_millis(ms);
        self
    }

    /// Sets the session TTL.
    #[inline]
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Sets the dedup window.
    #[inline]
    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Sets the pending-request ceiling.
    #[inline]
    #[must_use]
    pub fn with_max_pending_responses(mut self, max: usize) -> Self {
        self.max_pending_responses = max;
        self
    }
}

// ============================================================================
// Origin Check
// ============================================================================

impl GatewayConfig {
    /// Returns `true` if the given Origin header value is acceptable.
    ///
    /// `None` means the header was absent (a "null" origin).
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if !self.strict_origin {
            return true;
        }

        match origin {
            None => self.allow_null_origin,
            Some(value) => self
                .allowed_origins
                .iter()
                .any(|prefix| prefix == "*" || value.starts_with(prefix.as_str())),
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
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert!(config.auth_enabled);
        assert!(config.strict_origin);
        assert_eq!(config.max_clients, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.dedup_window, Duration::from_secs(5));
        assert_eq!(config.rate.global_limit, 300);
        assert_eq!(config.rate.sensitive_limit, 30);
        assert_eq!(config.rate.max_failed_attempts, 5);
    }

    #[test]
    fn test_builder_chain() {
        let config = GatewayConfig::new()
            .with_max_clients(2)
            .with_request_timeout_ms(5_000)
            .without_auth()
            .with_allowed_origin("https://panel.internal");

        assert_eq!(config.max_clients, 2);
        assert_eq!(config.request_timeout, Duration::from_millis(5_000));
        assert!(!config.auth_enabled);
        assert!(
            config
                .allowed_origins
                .contains(&"https://panel.internal".to_string())
        );
    }

    #[test]
    fn test_origin_allowed_prefix() {
        let config = GatewayConfig::default();
        assert!(config.origin_allowed(Some("moz-extension://abc123")));
        assert!(config.origin_allowed(Some("http://localhost:3000")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
    }

    #[test]
    fn test_origin_allowed_null() {
        let mut config = GatewayConfig::default();
        assert!(config.origin_allowed(None));

        config.allow_null_origin = false;
        assert!(!config.origin_allowed(None));
    }

    #[test]
    fn test_origin_wildcard() {
        let config = GatewayConfig::default().with_allowed_origin("*");
        assert!(config.origin_allowed(Some("https://anything.example")));
    }

    #[test]
    fn test_origin_check_disabled() {
        let config = GatewayConfig::default().without_strict_origin();
        assert!(config.origin_allowed(Some("https://evil.example")));
        assert!(config.origin_allowed(None));
    }
}
