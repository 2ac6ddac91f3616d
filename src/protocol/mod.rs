//! Wire message types.
//!
//! This module defines the message formats spoken on the gateway's two
//! WebSocket roles and mirrored by the HTTP surface.
//!
//! # Protocol Overview
//!
//! | Message Family | Direction | Purpose |
//! |----------------|-----------|---------|
//! | `auth_challenge` / `auth_response` / `auth_result` | both | Admission handshake |
//! | Automation request | automation → gateway | Command submission |
//! | Automation response / event | gateway → automation | Results and notifications |
//! | Extension inbound | extension → gateway | Completions, chunks, snapshots |
//! | Command envelope | gateway → extension | Dispatched commands |
//!
//! Unknown fields are ignored everywhere; missing required fields are a
//! protocol error. Extension messages arrive in two carrier shapes (bare
//! typed and wrapped request/notification) and are normalized before
//! dispatch.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `action` | Closed action set, parameter validation, dedup keys |
//! | `client` | Automation envelopes and server-pushed notifications |
//! | `extension` | Extension inbound messages and carrier unwrapping |
//! | `handshake` | Challenge/response handshake messages |

// ============================================================================
// Submodules
// ============================================================================

/// Closed action set and command parameters.
pub mod action;

/// Automation request/response envelopes and server notifications.
pub mod client;

/// Extension inbound message types.
pub mod extension;

/// Auth handshake message types.
pub mod handshake;

// ============================================================================
// Re-exports
// ============================================================================

pub use action::{Action, Command, CommandParams};
pub use client::{AutomationRequest, notify};
pub use extension::{CompletionPayload, ExtensionMessage};
pub use handshake::{AuthChallenge, AuthResponse, AuthResult};
