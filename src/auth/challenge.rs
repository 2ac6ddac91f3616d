//! One-shot challenge table.
//!
//! Each pre-auth connection owns at most one outstanding challenge.
//! Challenges are single-use: taken (and removed) on the first
//! verification attempt regardless of outcome, and swept on expiry.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::identifiers::ConnectionId;

// ============================================================================
// Constants
// ============================================================================

/// Challenge token length in bytes (hex-encoded to 32 chars on the wire).
const CHALLENGE_LEN: usize = 16;

// ============================================================================
// Challenge
// ============================================================================

/// An outstanding challenge owned by one pre-auth connection.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Hex-encoded random token.
    pub token: String,

    /// Instant past which the challenge no longer verifies.
    pub expires: Instant,
}

impl Challenge {
    /// Returns `true` if the challenge is still valid at `now`.
    #[inline]
    #[must_use]
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires
    }
}

// ============================================================================
// ChallengeTable
// ============================================================================

/// Table of outstanding challenges keyed by pre-auth connection.
#[derive(Debug, Default)]
pub struct ChallengeTable {
    inner: Mutex<FxHashMap<ConnectionId, Challenge>>,
}

impl ChallengeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh challenge for `connection_id`, replacing any prior
    /// one for the same connection.
    #[must_use]
    pub fn issue(&self, connection_id: ConnectionId, timeout: Duration) -> String {
        let mut bytes = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let challenge = Challenge {
            token: token.clone(),
            expires: Instant::now() + timeout,
        };

        self.inner.lock().insert(connection_id, challenge);
        token
    }

    /// Takes the challenge for `connection_id`, removing it.
    ///
    /// One-shot: callers get the entry at most once, whatever the
    /// verification outcome.
    #[must_use]
    pub fn take(&self, connection_id: ConnectionId) -> Option<Challenge> {
        self.inner.lock().remove(&connection_id)
    }

    /// Drops the challenge for a connection that went away pre-auth.
    pub fn forget(&self, connection_id: ConnectionId) {
        self.inner.lock().remove(&connection_id);
    }

    /// Sweeps expired challenges.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, challenge| challenge.is_valid(now));
        let expired = before - inner.len();
        if expired > 0 {
            debug!(expired, "Expired challenges purged");
        }
    }

    /// Number of outstanding challenges.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Clears the table on shutdown.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_produces_hex_token() {
        let table = ChallengeTable::new();
        let token = table.issue(ConnectionId::next(), Duration::from_secs(30));

        assert_eq!(token.len(), CHALLENGE_LEN * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let table = ChallengeTable::new();
        let a = table.issue(ConnectionId::next(), Duration::from_secs(30));
        let b = table.issue(ConnectionId::next(), Duration::from_secs(30));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_take_is_one_shot() {
        let table = ChallengeTable::new();
        let connection_id = ConnectionId::next();
        let token = table.issue(connection_id, Duration::from_secs(30));

        let challenge = table.take(connection_id).expect("first take");
        assert_eq!(challenge.token, token);

        // Replay: the entry is gone.
        assert!(table.take(connection_id).is_none());
    }

    #[tokio::test]
    async fn test_reissue_replaces() {
        let table = ChallengeTable::new();
        let connection_id = ConnectionId::next();

        let first = table.issue(connection_id, Duration::from_secs(30));
        let second = table.issue(connection_id, Duration::from_secs(30));
        assert_ne!(first, second);

        let challenge = table.take(connection_id).expect("take");
        assert_eq!(challenge.token, second);
        assert_eq!(table.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let table = ChallengeTable::new();
        let connection_id = ConnectionId::next();
        let _ = table.issue(connection_id, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(31)).await;

        let challenge = table.take(connection_id).expect("entry still present");
        assert!(!challenge.is_valid(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let table = ChallengeTable::new();
        let _ = table.issue(ConnectionId::next(), Duration::from_secs(10));
        let _ = table.issue(ConnectionId::next(), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(11)).await;
        table.purge_expired();
        assert_eq!(table.count(), 1);
    }
}
