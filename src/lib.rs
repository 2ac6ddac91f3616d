//! Browser Control Gateway.
//!
//! A server brokering commands and events between two classes of
//! WebSocket clients: *extensions* (browser-resident, able to drive
//! tabs, inject scripts, read cookies, stream HTML) and *automation*
//! clients (external programs issuing commands). An HTTP surface mirrors
//! the command set with long-poll and SSE result delivery.
//!
//! # Architecture
//!
//! ```text
//! automation WS ─┐                         ┌─▶ extension WS
//! HTTP POST ─────┼─▶ Correlator ─▶ ExtensionHub (round-robin)
//!                │        │
//!                │        ▼
//!                └─◀ CallbackStore ─▶ long-poll / SSE / callback POST
//! ```
//!
//! Key design points:
//!
//! - Challenge/response admission: HMAC-SHA256 over a single-use random
//!   challenge, constant-time comparison, TTL-bounded sessions
//! - One correlator entry per request: one caller, one chosen
//!   extension, one timer, exactly one terminal delivery
//! - Deterministic round-robin dispatch, never broadcast
//! - Sliding-window rate limits with auth-failure lockout
//! - Bounded queues everywhere on the hot path
//!
//! # Quick Start
//!
//! ```no_run
//! use browser_gateway::{Gateway, GatewayConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = Gateway::start(GatewayConfig::new()).await?;
//!     println!("ws on {}, http on {}", gateway.ws_addr(), gateway.http_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`audit`] | Append-only audit records and sink |
//! | [`auth`] | Secret discovery, challenges, sessions, HMAC verify |
//! | [`config`] | Typed configuration with defaults |
//! | [`correlator`] | Request state machine, callback store, dedup, streams |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | Process-wide event bus |
//! | [`gateway`] | WS front end: accept, handshake, read loops, heartbeat |
//! | [`http`] | HTTP front end: commands, long-poll, SSE, admin |
//! | [`hub`] | Extension and client registries |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`limiter`] | Sliding-window rate limiter and lockout |
//! | [`monitor`] | Health checks and admission control |
//! | [`protocol`] | Wire message types |

// ============================================================================
// Modules
// ============================================================================

/// Append-only audit records.
pub mod audit;

/// Challenge/response authentication.
pub mod auth;

/// Gateway configuration.
pub mod config;

/// Request/response correlation.
pub mod correlator;

/// Error types and result aliases.
pub mod error;

/// Process-wide event bus.
pub mod events;

/// WebSocket front end.
pub mod gateway;

/// HTTP front end.
pub mod http;

/// Connection registries.
pub mod hub;

/// Type-safe identifiers.
pub mod identifiers;

/// Sliding-window rate limiting.
pub mod limiter;

/// Resource monitoring.
pub mod monitor;

/// Wire message types.
pub mod protocol;

// ============================================================================
// Re-exports
// ============================================================================

// Core surface
pub use config::{GatewayConfig, RateLimitConfig, SERVER_VERSION};
pub use error::{Error, Result};
pub use gateway::{Connection, Gateway};

// Auth types
pub use auth::{AuthManager, Role, Session, SharedSecret};

// Correlation types
pub use correlator::{CallbackStore, Correlator, Delivery, RequestStatus, Submission};

// Identifier types
pub use identifiers::{ClientId, ConnectionId, RequestId, SessionId, TabId};

// Protocol types
pub use protocol::{Action, Command, CommandParams};
