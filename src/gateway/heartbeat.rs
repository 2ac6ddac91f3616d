//! Heartbeat tick and session surveillance.
//!
//! Every `heartbeat_interval` the gateway pings each admitted
//! connection, closes the silent ones with 1001, and inspects their
//! sessions: an expired session gets a `session_expired` event and a
//! grace close; one inside the warning lead gets a single
//! `session_expiring` event.
//!
//! Heartbeats never reorder terminal transitions of in-flight requests;
//! an expired session only refuses new requests while dispatched ones
//! ride to their terminal state.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::audit::{AuditKind, AuditRecord};
use crate::auth::Role;
use crate::protocol::notify;

use super::{Connection, Gateway};

// ============================================================================
// Constants
// ============================================================================

/// Grace between the `session_expired` event and the close frame.
const EXPIRED_CLOSE_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Heartbeat Loop
// ============================================================================

/// Background task pinging every admitted connection.
pub async fn run(gateway: Arc<Gateway>) {
    let mut tick = tokio::time::interval(gateway.config().heartbeat_interval);
    debug!("Heartbeat loop started");

    loop {
        tick.tick().await;
        if gateway.is_shutdown() {
            break;
        }

        let connections: Vec<Connection> = gateway
            .extensions()
            .snapshot()
            .into_iter()
            .chain(gateway.clients().snapshot())
            .collect();

        for connection in connections {
            if !connection.is_open() {
                remove_from_hub(&gateway, &connection);
                continue;
            }

            connection.send_ping();

            if connection.since_last_pong() > gateway.config().heartbeat_timeout {
                info!(connection_id = %connection.id(), "Heartbeat timeout");
                connection.close(1001, "Heartbeat timeout");
                remove_from_hub(&gateway, &connection);
                gateway.audit().record(
                    AuditRecord::new(AuditKind::ConnectionClosed)
                        .client_type(connection.role().as_str())
                        .address(connection.addr())
                        .details(serde_json::json!({"reason": "heartbeat"})),
                );
                continue;
            }

            surveil_session(&gateway, &connection);
        }
    }

    debug!("Heartbeat loop terminated");
}

/// Session-expiry surveillance for one connection.
fn surveil_session(gateway: &Arc<Gateway>, connection: &Connection) {
    let Some(session_id) = connection.session_id() else {
        return;
    };

    match gateway.auth().sessions().validate(session_id) {
        Err(_) => {
            info!(%session_id, connection_id = %connection.id(), "Session expired");
            let _ = connection.send_json(&notify::session_expired());
            gateway.auth().sessions().remove(session_id);
            gateway.audit().record(
                AuditRecord::new(AuditKind::SessionExpired)
                    .session(session_id)
                    .client_type(connection.role().as_str())
                    .address(connection.addr()),
            );

            let connection = connection.clone();
            tokio::spawn(async move {
                tokio::time::sleep(EXPIRED_CLOSE_GRACE).await;
                connection.close(1001, "Session expired");
            });
        }
        Ok(session) => {
            let remaining = session.expires_in(tokio::time::Instant::now());
            if remaining <= gateway.config().session_expiry_warning
                && gateway.auth().sessions().mark_warned(session_id)
            {
                debug!(%session_id, remaining_secs = remaining.as_secs(), "Session expiring soon");
                let _ = connection.send_json(&notify::session_expiring(remaining.as_secs()));
            }
        }
    }
}

/// Removes a connection from whichever hub holds it.
fn remove_from_hub(gateway: &Arc<Gateway>, connection: &Connection) {
    match connection.role() {
        Role::Extension => {
            let _ = gateway.extensions().remove(connection.id());
        }
        Role::Automation => {
            let _ = gateway.clients().remove(connection.id());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
