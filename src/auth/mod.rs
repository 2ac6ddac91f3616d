//! Challenge/response authentication.
//!
//! The auth manager owns the shared secret, the one-shot challenge table,
//! and the session table. Verification recomputes
//! `HMAC-SHA256(secret, challenge)` and compares it to the client's
//! response with a constant-time equality check.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `secret` | Shared-secret discovery chain |
//! | `challenge` | One-shot challenge table |
//! | `session` | Session table, roles, permission set |

// ============================================================================
// Submodules
// ============================================================================

/// Shared-secret discovery.
pub mod secret;

/// One-shot challenge table.
pub mod challenge;

/// Session table and roles.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use challenge::{Challenge, ChallengeTable};
pub use secret::{SECRET_ENV_VAR, SharedSecret};
pub use session::{PERMISSIONS, Role, Session, SessionTable};

// ============================================================================
// Imports
// ============================================================================

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::time::Instant;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, ConnectionId};

// ============================================================================
// Types
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// AuthManager
// ============================================================================

/// Owns the secret, challenge table, and session table.
#[derive(Debug)]
pub struct AuthManager {
    secret: SharedSecret,
    challenges: ChallengeTable,
    sessions: SessionTable,
}

impl AuthManager {
    /// Creates a manager, running secret discovery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Secret`] when the key file cannot be read or
    /// written.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let secret = SharedSecret::discover(config)?;
        Ok(Self {
            secret,
            challenges: ChallengeTable::new(),
            sessions: SessionTable::new(),
        })
    }

    /// Creates a manager with explicit secret material (tests, embedding).
    #[must_use]
    pub fn with_secret(secret: SharedSecret) -> Self {
        Self {
            secret,
            challenges: ChallengeTable::new(),
            sessions: SessionTable::new(),
        }
    }

    /// Returns the challenge table.
    #[inline]
    #[must_use]
    pub fn challenges(&self) -> &ChallengeTable {
        &self.challenges
    }

    /// Returns the session table.
    #[inline]
    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Returns the shared secret hex-encoded (local-only admin surface).
    #[must_use]
    pub fn secret_hex(&self) -> String {
        self.secret.to_hex()
    }

    /// Computes the expected response for a challenge token.
    ///
    /// Exposed for clients and tests; the gateway itself only verifies.
    #[must_use]
    pub fn sign_challenge(secret: &SharedSecret, challenge: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(challenge.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies an `auth_response` for the given pre-auth connection.
    ///
    /// The challenge is consumed whatever the outcome (single-use).
    ///
    /// # Errors
    ///
    /// - [`Error::ChallengeExpired`] when no live challenge exists
    /// - [`Error::AuthFailed`] on malformed or mismatching responses
    pub fn verify(&self, connection_id: ConnectionId, response_hex: &str) -> Result<()> {
        let challenge = self
            .challenges
            .take(connection_id)
            .ok_or(Error::ChallengeExpired)?;

        if !challenge.is_valid(Instant::now()) {
            return Err(Error::ChallengeExpired);
        }

        let response = hex::decode(response_hex)
            .map_err(|_| Error::auth_failed("response is not valid hex"))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(challenge.token.as_bytes());

        // verify_slice is constant-time and rejects length mismatches.
        mac.verify_slice(&response)
            .map_err(|_| Error::auth_failed("response does not match challenge"))?;

        debug!(%connection_id, "Challenge verified");
        Ok(())
    }

    /// Issues a session after successful verification.
    #[must_use]
    pub fn admit(
        &self,
        client_id: Option<String>,
        role: Role,
        ttl: std::time::Duration,
    ) -> Session {
        let client_id = client_id.map_or_else(ClientId::generate, ClientId::new);
        self.sessions.create(client_id, role, ttl)
    }

    /// Clears challenges and sessions on shutdown.
    pub fn clear(&self) {
        self.challenges.clear();
        self.sessions.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
