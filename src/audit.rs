//! Append-only audit records.
//!
//! Auth outcomes and sensitive operations produce [`AuditRecord`]s pushed
//! through a bounded channel. The gateway drains the channel into
//! structured log events; an external store may take the raw stream
//! instead. Records are never mutated after emission.
//!
//! Persistence of audit rows is an external concern; this module only
//! produces the records and keeps emission off the hot path.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::identifiers::{ClientId, RequestId, SessionId, TabId};

// ============================================================================
// Constants
// ============================================================================

/// Bounded queue length between emitters and the drain task.
const SINK_CAPACITY: usize = 1024;

// ============================================================================
// AuditKind
// ============================================================================

/// Classification of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Successful challenge/response handshake.
    AuthSuccess,
    /// Failed challenge/response handshake.
    AuthFailure,
    /// Address lockout engaged.
    AuthLockout,
    /// Connection rejected before the handshake (origin, lock, capacity).
    ConnectionRejected,
    /// Connection admitted to a hub.
    ConnectionAdmitted,
    /// Connection closed.
    ConnectionClosed,
    /// A sensitive action was dispatched.
    SensitiveAction,
    /// A request reached a terminal state.
    RequestTerminal,
    /// Session expired while the connection was alive.
    SessionExpired,
    /// Gateway shutdown.
    Shutdown,
}

// ============================================================================
// AuditRecord
// ============================================================================

/// One append-only audit row.
///
/// Optional fields are omitted from the serialized form when absent,
/// matching the external store's sparse schema.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,

    /// Event classification.
    #[serde(rename = "eventType")]
    pub kind: AuditKind,

    /// Session the event belongs to, if authenticated.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Caller identity, if known.
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,

    /// Caller role ("extension" or "automation").
    #[serde(rename = "clientType", skip_serializing_if = "Option::is_none")]
    pub client_type: Option<&'static str>,

    /// Remote socket address.
    #[serde(rename = "clientAddress", skip_serializing_if = "Option::is_none")]
    pub client_address: Option<SocketAddr>,

    /// Action name for operation events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Target tab for operation events.
    #[serde(rename = "targetTabId", skip_serializing_if = "Option::is_none")]
    pub target_tab_id: Option<TabId>,

    /// Outcome ("success", "error", "timeout", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Operation duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,

    /// Request the event belongs to.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Free-form detail payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuditRecord {
    /// Creates a record of the given kind stamped with the current time.
    #[must_use]
    pub fn new(kind: AuditKind) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            timestamp,
            kind,
            session_id: None,
            client_id: None,
            client_type: None,
            client_address: None,
            action: None,
            target_tab_id: None,
            status: None,
            duration: None,
            request_id: None,
            details: None,
        }
    }

    /// Sets the session ID.
    #[inline]
    #[must_use]
    pub fn session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Sets the client ID.
    #[inline]
    #[must_use]
    pub fn client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Sets the client role.
    #[inline]
    #[must_use]
    pub fn client_type(mut self, role: &'static str) -> Self {
        self.client_type = Some(role);
        self
    }

    /// Sets the remote address.
    #[inline]
    #[must_use]
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.client_address = Some(addr);
        self
    }

    /// Sets the action name.
    #[inline]
    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Sets the target tab.
    #[inline]
    #[must_use]
    pub fn target_tab(mut self, tab_id: TabId) -> Self {
        self.target_tab_id = Some(tab_id);
        self
    }

    /// Sets the outcome status.
    #[inline]
    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the operation duration.
    #[inline]
    #[must_use]
    pub fn duration_ms(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Sets the request ID.
    #[inline]
    #[must_use]
    pub fn request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Sets the detail payload.
    #[inline]
    #[must_use]
    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ============================================================================
// AuditSink
// ============================================================================

/// Handle for emitting audit records.
///
/// Cloneable; all clones feed the same stream. Emission never blocks:
/// when the queue is full the record is dropped with a warning rather
/// than stalling a connection task.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditSink {
    /// Creates a sink and the stream an external consumer drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (Self { tx }, rx)
    }

    /// Creates a sink whose stream is drained into structured log events.
    ///
    /// Used when no external store is attached.
    #[must_use]
    pub fn logging() -> Self {
        let (sink, mut rx) = Self::channel();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match serde_json::to_string(&record) {
                    Ok(row) => debug!(target: "gateway::audit", %row, "audit"),
                    Err(e) => warn!(error = %e, "Failed to serialize audit record"),
                }
            }
        });

        sink
    }

    /// Emits a record.
    ///
    /// Drops the record (with a warning) when the queue is full.
    pub fn record(&self, record: AuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            warn!(error = %e, "Audit queue full, record dropped");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_record_builder() {
        let record = AuditRecord::new(AuditKind::SensitiveAction)
            .client(ClientId::new("c1"))
            .client_type("automation")
            .action("execute_script")
            .target_tab(TabId::new(7))
            .status("success")
            .duration_ms(120)
            .request(RequestId::new("r1"));

        assert_eq!(record.kind, AuditKind::SensitiveAction);
        assert_eq!(record.action.as_deref(), Some("execute_script"));
        assert_eq!(record.target_tab_id, Some(TabId::new(7)));
        assert!(record.timestamp > 0);
    }

    #[test]
    fn test_record_serialization_sparse() {
        let record = AuditRecord::new(AuditKind::AuthFailure)
            .address("203.0.113.4:9000".parse().expect("addr"))
            .details(json!({"reason": "hmac mismatch"}));

        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["eventType"], "auth_failure");
        assert_eq!(value["clientAddress"], "203.0.113.4:9000");
        // Absent optional fields are omitted entirely.
        assert!(value.get("sessionId").is_none());
        assert!(value.get("targetTabId").is_none());
    }

    #[tokio::test]
    async fn test_sink_delivers_to_stream() {
        let (sink, mut rx) = AuditSink::channel();

        sink.record(AuditRecord::new(AuditKind::AuthSuccess).client(ClientId::new("c1")));

        let record = rx.recv().await.expect("record");
        assert_eq!(record.kind, AuditKind::AuthSuccess);
        assert_eq!(record.client_id, Some(ClientId::new("c1")));
    }

    #[tokio::test]
    async fn test_sink_never_blocks_when_full() {
        let (sink, rx) = AuditSink::channel();
        // Do not drain; overfill the queue.
        for _ in 0..(SINK_CAPACITY + 10) {
            sink.record(AuditRecord::new(AuditKind::ConnectionClosed));
        }
        drop(rx);
        // Emission after the receiver is gone must not panic either.
        sink.record(AuditRecord::new(AuditKind::Shutdown));
    }
}
