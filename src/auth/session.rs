//! Session table.
//!
//! A session is a TTL-bounded capability issued after a successful
//! handshake. Lifetime runs from creation; activity updates feed the
//! expiry-warning protocol but never extend the TTL.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::{ClientId, SessionId};

// ============================================================================
// Role
// ============================================================================

/// Connection role, chosen by the `type` query parameter at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Browser-resident client answering commands.
    Extension,
    /// External client issuing commands.
    Automation,
}

impl Role {
    /// Parses the `type` query parameter. Unknown values default to
    /// extension.
    #[must_use]
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("automation") => Self::Automation,
            _ => Self::Extension,
        }
    }

    /// Returns the wire name of the role.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Extension => "extension",
            Self::Automation => "automation",
        }
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Fixed permission set granted to every admitted session.
pub const PERMISSIONS: [&str; 10] = [
    "get_tabs",
    "open_url",
    "close_tab",
    "get_html",
    "execute_script",
    "inject_css",
    "get_cookies",
    "upload_file_to_tab",
    "subscribe_events",
    "unsubscribe_events",
];

// ============================================================================
// Session
// ============================================================================

/// An issued session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,

    /// Caller identity (chosen during the handshake or generated).
    pub client_id: ClientId,

    /// Role the session was issued for.
    pub role: Role,

    /// Granted permission set.
    pub permissions: &'static [&'static str],

    /// Issuance instant.
    pub created: Instant,

    /// Expiry instant (`created + ttl`, never extended).
    pub expires: Instant,

    /// Last message observed on the session's connection.
    pub last_activity: Instant,

    /// Whether the single `session_expiring` warning went out.
    pub expiry_warned: bool,
}

impl Session {
    /// Returns `true` if the session is expired at `now`.
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }

    /// Remaining lifetime at `now` (zero when expired).
    #[inline]
    #[must_use]
    pub fn expires_in(&self, now: Instant) -> Duration {
        self.expires.saturating_duration_since(now)
    }
}

// ============================================================================
// SessionTable
// ============================================================================

/// Table of issued sessions.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<FxHashMap<SessionId, Session>>,
}

impl SessionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a session for `client_id` with the given TTL.
    #[must_use]
    pub fn create(&self, client_id: ClientId, role: Role, ttl: Duration) -> Session {
        let now = Instant::now();
        let session = Session {
            id: SessionId::generate(),
            client_id,
            role,
            permissions: &PERMISSIONS,
            created: now,
            expires: now + ttl,
            last_activity: now,
            expiry_warned: false,
        };

        self.inner.lock().insert(session.id, session.clone());
        debug!(session_id = %session.id, role = role.as_str(), "Session issued");
        session
    }

    /// Looks up a non-expired session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpired`] for absent or expired sessions.
    pub fn validate(&self, session_id: SessionId) -> Result<Session> {
        let now = Instant::now();
        let inner = self.inner.lock();

        match inner.get(&session_id) {
            Some(session) if !session.is_expired(now) => Ok(session.clone()),
            _ => Err(Error::session_expired(session_id)),
        }
    }

    /// Updates the session's last-activity stamp.
    ///
    /// Feeds expiry surveillance only; the TTL does not slide.
    pub fn touch(&self, session_id: SessionId) {
        if let Some(session) = self.inner.lock().get_mut(&session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Marks the expiry warning as sent.
    ///
    /// Returns `true` only for the call that first marked it, so exactly
    /// one warning goes out per session.
    pub fn mark_warned(&self, session_id: SessionId) -> bool {
        match self.inner.lock().get_mut(&session_id) {
            Some(session) if !session.expiry_warned => {
                session.expiry_warned = true;
                true
            }
            _ => false,
        }
    }

    /// Removes a session.
    pub fn remove(&self, session_id: SessionId) {
        self.inner.lock().remove(&session_id);
    }

    /// Sweeps expired sessions, returning the removed entries.
    pub fn purge_expired(&self) -> Vec<Session> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<SessionId> = inner
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id)
            .collect();

        expired
            .iter()
            .filter_map(|id| inner.remove(id))
            .collect()
    }

    /// Number of live sessions.
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
    async fn test_create_and_validate() {
        let table = SessionTable::new();
        let session = table.create(
            ClientId::new("bot-1"),
            Role::Automation,
            Duration::from_secs(3600),
        );

        let found = table.validate(session.id).expect("valid");
        assert_eq!(found.client_id, ClientId::new("bot-1"));
        assert_eq!(found.role, Role::Automation);
        assert_eq!(found.permissions.len(), PERMISSIONS.len());
    }

    #[tokio::test]
    async fn test_validate_unknown_session() {
        let table = SessionTable::new();
        let err = table.validate(SessionId::generate()).unwrap_err();
        assert!(matches!(err, Error::SessionExpired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_does_not_slide() {
        let table = SessionTable::new();
        let session = table.create(
            ClientId::new("bot-1"),
            Role::Automation,
            Duration::from_secs(10),
        );

        // Activity right up to the deadline does not extend it.
        tokio::time::advance(Duration::from_secs(9)).await;
        table.touch(session.id);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(table.validate(session.id).is_err());
    }

    #[tokio::test]
    async fn test_warning_fires_once() {
        let table = SessionTable::new();
        let session = table.create(
            ClientId::new("bot-1"),
            Role::Automation,
            Duration::from_secs(60),
        );

        assert!(table.mark_warned(session.id));
        assert!(!table.mark_warned(session.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let table = SessionTable::new();
        let short = table.create(
            ClientId::new("short"),
            Role::Automation,
            Duration::from_secs(5),
        );
        let long = table.create(
            ClientId::new("long"),
            Role::Extension,
            Duration::from_secs(500),
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        let removed = table.purge_expired();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, short.id);
        assert!(table.validate(long.id).is_ok());
    }

    #[test]
    fn test_role_from_query() {
        assert_eq!(Role::from_query(Some("automation")), Role::Automation);
        assert_eq!(Role::from_query(Some("extension")), Role::Extension);
        // Unknown type defaults to extension.
        assert_eq!(Role::from_query(Some("spaceship")), Role::Extension);
        assert_eq!(Role::from_query(None), Role::Extension);
    }
}
