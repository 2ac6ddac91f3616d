//! Client hub: automation registry and event subscriptions.
//!
//! Holds the admitted automation connections and their per-connection
//! subscription sets. A fan-out task bridges the process-wide event bus
//! to subscribed connections as `{type: "event", event, data}` pushes.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::events::BusEvent;
use crate::gateway::Connection;
use crate::identifiers::ConnectionId;
use crate::protocol::notify;

// ============================================================================
// Constants
// ============================================================================

/// The fixed set of subscribable event names.
pub const EVENT_NAMES: [&str; 12] = [
    "tabs_update",
    "tab_opened",
    "tab_closed",
    "tab_url_changed",
    "tab_html_received",
    "script_executed",
    "css_injected",
    "cookies_received",
    "init",
    "error",
    "request_timeout",
    "custom_event",
];

// ============================================================================
// ClientSlot
// ============================================================================

#[derive(Debug)]
struct ClientSlot {
    connection: Connection,
    subscriptions: FxHashSet<String>,
}

// ============================================================================
// ClientHub
// ============================================================================

/// Registry of admitted automation connections.
#[derive(Debug, Default)]
pub struct ClientHub {
    connections: RwLock<FxHashMap<ConnectionId, ClientSlot>>,
}

impl ClientHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an admitted automation connection.
    pub fn register(&self, connection: Connection) {
        let id = connection.id();
        self.connections.write().insert(
            id,
            ClientSlot {
                connection,
                subscriptions: FxHashSet::default(),
            },
        );
        debug!(connection_id = %id, "Automation client registered");
    }

    /// Removes a connection by ID.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Connection> {
        let slot = self.connections.write().remove(&connection_id)?;
        debug!(connection_id = %connection_id, "Automation client removed");
        Some(slot.connection)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns `true` if `connection_id` is registered.
    #[must_use]
    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().contains_key(&connection_id)
    }

    /// Snapshot of the registered connections (for the heartbeat tick).
    #[must_use]
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .read()
            .values()
            .map(|slot| slot.connection.clone())
            .collect()
    }

    /// Pushes a message to one client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] when the client is gone or the
    /// send fails.
    pub fn send_to(&self, connection_id: ConnectionId, value: &Value) -> Result<()> {
        let connections = self.connections.read();
        let slot = connections
            .get(&connection_id)
            .ok_or(Error::ConnectionClosed)?;
        slot.connection.send_json(value)
    }

    /// Subscribes a connection to event names.
    ///
    /// Unknown names are ignored; the accepted names are returned.
    pub fn subscribe(&self, connection_id: ConnectionId, events: &[String]) -> Vec<String> {
        let mut connections = self.connections.write();
        let Some(slot) = connections.get_mut(&connection_id) else {
            return Vec::new();
        };

        let mut accepted = Vec::new();
        for name in events {
            if EVENT_NAMES.contains(&name.as_str()) {
                slot.subscriptions.insert(name.clone());
                accepted.push(name.clone());
            }
        }
        accepted
    }

    /// Unsubscribes a connection from event names.
    pub fn unsubscribe(&self, connection_id: ConnectionId, events: &[String]) {
        let mut connections = self.connections.write();
        if let Some(slot) = connections.get_mut(&connection_id) {
            for name in events {
                slot.subscriptions.remove(name);
            }
        }
    }

    /// Pushes `{type: "event", event, data}` to every subscribed client.
    pub fn broadcast_event(&self, name: &str, data: &Value) {
        let targets: Vec<Connection> = {
            let connections = self.connections.read();
            connections
                .values()
                .filter(|slot| slot.subscriptions.contains(name))
                .map(|slot| slot.connection.clone())
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let message = notify::event(name, data.clone());
        for connection in targets {
            if let Err(e) = connection.send_json(&message) {
                trace!(connection_id = %connection.id(), error = %e, "Event push failed");
            }
        }
    }

    /// Fan-out task bridging the event bus to subscribed clients.
    ///
    /// `callback_result` is excluded: typed responses reach automation
    /// callers through the correlator's direct push.
    pub async fn run_fanout(self: Arc<Self>, mut rx: broadcast::Receiver<BusEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !event.is_callback_result() {
                        self.broadcast_event(&event.event, &event.data);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event fan-out lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Closes every connection with the given code and reason.
    pub fn close_all(&self, code: u16, reason: &str) {
        let connections: Vec<Connection> = {
            let mut guard = self.connections.write();
            guard.drain().map(|(_, slot)| slot.connection).collect()
        };
        for connection in connections {
            connection.close(code, reason);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
