//! Extension hub: registry and deterministic round-robin dispatch.
//!
//! Holds the admitted extension connections. Dispatch is round-robin,
//! never broadcast: one command goes to exactly one extension, and the
//! rolling index advances past the chosen slot so consecutive commands
//! spread across the set. If every slot fails the send, the caller gets
//! the no-extensions error.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gateway::Connection;
use crate::identifiers::ConnectionId;

// ============================================================================
// ExtensionHub
// ============================================================================

/// Registry of admitted extension connections.
#[derive(Debug, Default)]
pub struct ExtensionHub {
    /// Admitted connections in admission order.
    connections: RwLock<Vec<Connection>>,

    /// Rolling start index for round-robin selection.
    next_index: Mutex<usize>,
}

impl ExtensionHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an admitted extension connection.
    pub fn register(&self, connection: Connection) {
        let mut connections = self.connections.write();
        debug!(connection_id = %connection.id(), slot = connections.len(), "Extension registered");
        connections.push(connection);
    }

    /// Removes a connection by ID.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Connection> {
        let mut connections = self.connections.write();
        let position = connections.iter().position(|c| c.id() == connection_id)?;
        let removed = connections.remove(position);
        debug!(connection_id = %connection_id, "Extension removed");
        Some(removed)
    }

    /// Number of registered extensions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns `true` if `connection_id` is registered.
    #[must_use]
    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections
            .read()
            .iter()
            .any(|c| c.id() == connection_id)
    }

    /// Drops connections whose sockets are no longer open.
    ///
    /// Returns the number removed. Run once before rejecting an admission
    /// for capacity.
    pub fn cleanup_dead(&self) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(Connection::is_open);
        let removed = before - connections.len();
        if removed > 0 {
            warn!(removed, "Dead extension connections dropped");
        }
        removed
    }

    /// Snapshot of the registered connections (for the heartbeat tick).
    #[must_use]
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().clone()
    }

    /// Sends a command envelope to exactly one extension.
    ///
    /// Starts at the rolling index and tries each slot in turn; the first
    /// successful send wins and the index advances past that slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoExtensions`] when every slot fails.
    pub fn send_to_extensions(&self, envelope: &Value) -> Result<ConnectionId> {
        let json = serde_json::to_string(envelope)?;
        let connections = self.connections.read();

        if connections.is_empty() {
            return Err(Error::NoExtensions);
        }

        let start = {
            let index = self.next_index.lock();
            *index % connections.len()
        };

        for offset in 0..connections.len() {
            let slot = (start + offset) % connections.len();
            let connection = &connections[slot];

            if !connection.is_open() {
                continue;
            }

            match connection.send_text(json.clone()) {
                Ok(()) => {
                    *self.next_index.lock() = slot + 1;
                    debug!(connection_id = %connection.id(), slot, "Command dispatched");
                    return Ok(connection.id());
                }
                Err(e) => {
                    warn!(connection_id = %connection.id(), error = %e, "Dispatch failed, trying next extension");
                }
            }
        }

        Err(Error::NoExtensions)
    }

    /// Closes every connection with the given code and reason.
    pub fn close_all(&self, code: u16, reason: &str) {
        let connections: Vec<Connection> = {
            let mut guard = self.connections.write();
            guard.drain(..).collect()
        };
        for connection in connections {
            connection.close(code, reason);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::StreamExt;
    use futures::channel::mpsc::UnboundedReceiver;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message;

    use crate::auth::Role;

    fn extension() -> (Connection, UnboundedReceiver<Message>) {
        let (sink, stream) = futures::channel::mpsc::unbounded();
        let connection = Connection::attach(
            ConnectionId::next(),
            "127.0.0.1:9100".parse().expect("addr"),
            Role::Extension,
            sink,
        );
        (connection, stream)
    }

    async fn next_text(stream: &mut UnboundedReceiver<Message>) -> String {
        match stream.next().await {
            Some(Message::Text(text)) => text.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_sole_extension() {
        let hub = ExtensionHub::new();
        let (connection, mut stream) = extension();
        let id = connection.id();
        hub.register(connection);

        let chosen = hub
            .send_to_extensions(&json!({"type": "open_url", "requestId": "r1"}))
            .expect("dispatch");
        assert_eq!(chosen, id);

        let text = next_text(&mut stream).await;
        assert!(text.contains("open_url"));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let hub = ExtensionHub::new();
        let (a, mut stream_a) = extension();
        let (b, mut stream_b) = extension();
        let (id_a, id_b) = (a.id(), b.id());
        hub.register(a);
        hub.register(b);

        let first = hub.send_to_extensions(&json!({"n": 1})).expect("dispatch");
        let second = hub.send_to_extensions(&json!({"n": 2})).expect("dispatch");
        let third = hub.send_to_extensions(&json!({"n": 3})).expect("dispatch");

        // Deterministic rotation: a, b, a.
        assert_eq!(first, id_a);
        assert_eq!(second, id_b);
        assert_eq!(third, id_a);

        assert!(next_text(&mut stream_a).await.contains("1"));
        assert!(next_text(&mut stream_b).await.contains("2"));
        assert!(next_text(&mut stream_a).await.contains("3"));
    }

    #[tokio::test]
    async fn test_single_dispatch_never_broadcasts() {
        let hub = ExtensionHub::new();
        let (a, mut stream_a) = extension();
        let (b, mut stream_b) = extension();
        hub.register(a);
        hub.register(b);

        hub.send_to_extensions(&json!({"only": true})).expect("dispatch");

        // First extension got the frame; the second got nothing.
        let _ = next_text(&mut stream_a).await;
        drop(hub);
        drop(stream_a);
        // After hub drop the writer ends; an empty stream proves no frame.
        assert!(stream_b.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_slot_advances_to_next() {
        let hub = ExtensionHub::new();
        let (a, stream_a) = extension();
        let (b, mut stream_b) = extension();
        let id_b = b.id();

        // Close the first extension's socket side.
        a.close(1001, "gone");
        drop(stream_a);
        hub.register(a);
        hub.register(b);

        let chosen = hub.send_to_extensions(&json!({"n": 1})).expect("dispatch");
        assert_eq!(chosen, id_b);
        let _ = next_text(&mut stream_b).await;
    }

    #[tokio::test]
    async fn test_empty_hub_errors() {
        let hub = ExtensionHub::new();
        let err = hub.send_to_extensions(&json!({})).unwrap_err();
        assert!(matches!(err, Error::NoExtensions));
    }

    #[tokio::test]
    async fn test_all_slots_dead_errors() {
        let hub = ExtensionHub::new();
        let (a, _stream_a) = extension();
        a.close(1001, "gone");
        hub.register(a);

        let err = hub.send_to_extensions(&json!({})).unwrap_err();
        assert!(matches!(err, Error::NoExtensions));
    }

    #[tokio::test]
    async fn test_cleanup_dead() {
        let hub = ExtensionHub::new();
        let (a, _stream_a) = extension();
        let (b, _stream_b) = extension();
        a.close(1001, "gone");
        hub.register(a);
        hub.register(b);

        assert_eq!(hub.count(), 2);
        assert_eq!(hub.cleanup_dead(), 1);
        assert_eq!(hub.count(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let hub = ExtensionHub::new();
        let (a, _stream) = extension();
        let id = a.id();
        hub.register(a);

        assert!(hub.contains(id));
        assert!(hub.remove(id).is_some());
        assert!(!hub.contains(id));
        assert!(hub.remove(id).is_none());
    }
}
