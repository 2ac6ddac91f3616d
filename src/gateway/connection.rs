//! Per-connection state and serialized writes.
//!
//! Each accepted WebSocket gets one [`Connection`] handle and one writer
//! task. All writes to a socket flow through the handle's bounded
//! outbound channel, so frames for one peer are ordered and no hot path
//! queues unboundedly. The read half stays with the accept task, which
//! runs the role-specific dispatch loop.
//!
//! ```text
//! correlator ─┐
//! hubs ───────┼─ try_send ─▶ outbound mpsc ─▶ writer task ─▶ socket
//! heartbeat ──┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, trace, warn};

use crate::auth::Role;
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, ConnectionId, SessionId};

// ============================================================================
// Constants
// ============================================================================

/// Outbound frames queued per connection before sends fail.
const OUTBOUND_CAPACITY: usize = 64;

// ============================================================================
// ConnectionState
// ============================================================================

/// Mutable per-connection bookkeeping, updated by the read loop and the
/// heartbeat tick.
#[derive(Debug)]
struct ConnectionState {
    session_id: Option<SessionId>,
    client_id: Option<ClientId>,
    created: tokio::time::Instant,
    last_activity: tokio::time::Instant,
    last_pong: tokio::time::Instant,
    message_count: u64,
    open: bool,
}

// ============================================================================
// Connection
// ============================================================================

/// Cloneable handle to one accepted WebSocket connection.
///
/// The handle owns the outbound lane; the read half stays with the
/// accept task. Exactly one hub references an admitted connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    role: Role,
    outbound: mpsc::Sender<Message>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Connection {
    /// Creates a connection handle and spawns its writer task over `sink`.
    pub fn attach<S>(id: ConnectionId, addr: SocketAddr, role: Role, sink: S) -> Self
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: std::fmt::Display,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let now = tokio::time::Instant::now();

        let state = Arc::new(Mutex::new(ConnectionState {
            session_id: None,
            client_id: None,
            created: now,
            last_activity: now,
            last_pong: now,
            message_count: 0,
            open: true,
        }));

        tokio::spawn(Self::run_writer(id, sink, outbound_rx));

        Self {
            id,
            addr,
            role,
            outbound,
            state,
        }
    }

    /// Writer task: drains the outbound channel into the socket.
    async fn run_writer<S>(id: ConnectionId, mut sink: S, mut rx: mpsc::Receiver<Message>)
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: std::fmt::Display,
    {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                warn!(connection_id = %id, error = %e, "Socket write failed");
                break;
            }
            if closing {
                break;
            }
        }

        let _ = sink.close().await;
        debug!(connection_id = %id, "Writer task terminated");
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Connection identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote socket address.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Role chosen at connect time.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Session bound to this connection, once authenticated.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session_id
    }

    /// Caller identity, once authenticated.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.state.lock().client_id.clone()
    }

    /// Binds the issued session to the connection.
    pub fn bind_session(&self, session_id: SessionId, client_id: ClientId) {
        let mut state = self.state.lock();
        state.session_id = Some(session_id);
        state.client_id = Some(client_id);
    }

    /// Returns `true` while the connection accepts writes.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open && !self.outbound.is_closed()
    }

    /// Messages observed on the read side.
    #[inline]
    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.state.lock().message_count
    }

    /// Time since the connection was accepted.
    #[inline]
    #[must_use]
    pub fn age(&self) -> Duration {
        self.state.lock().created.elapsed()
    }

    /// Time since the last pong frame.
    #[inline]
    #[must_use]
    pub fn since_last_pong(&self) -> Duration {
        self.state.lock().last_pong.elapsed()
    }

    /// Time since the last inbound message.
    #[inline]
    #[must_use]
    pub fn since_last_activity(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }
}

// ============================================================================
// Connection - Bookkeeping
// ============================================================================

impl Connection {
    /// Records inbound activity (any message).
    pub fn touch_activity(&self) {
        let mut state = self.state.lock();
        state.last_activity = tokio::time::Instant::now();
        state.message_count += 1;
    }

    /// Records a pong frame.
    pub fn touch_pong(&self) {
        self.state.lock().last_pong = tokio::time::Instant::now();
    }
}

// ============================================================================
// Connection - Writes
// ============================================================================

impl Connection {
    /// Sends a JSON value as one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] when the connection is gone or
    /// its outbound queue is full (the caller treats both as a failed
    /// send and moves on).
    pub fn send_json(&self, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.send_text(json)
    }

    /// Sends a pre-serialized text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] when the send fails.
    pub fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.outbound
            .try_send(Message::Text(text.into()))
            .map_err(|_| Error::ConnectionClosed)?;
        trace!(connection_id = %self.id, "Frame queued");
        Ok(())
    }

    /// Sends a WS-level ping.
    pub fn send_ping(&self) {
        let _ = self.outbound.try_send(Message::Ping(Vec::new().into()));
    }

    /// Answers a WS-level ping from the peer.
    pub fn send_pong(&self, payload: Vec<u8>) {
        let _ = self.outbound.try_send(Message::Pong(payload.into()));
    }

    /// Queues a close frame and marks the connection closed.
    ///
    /// The writer task terminates after flushing the frame.
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
        }

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.try_send(Message::Close(Some(frame)));
        debug!(connection_id = %self.id, code, reason, "Connection closing");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::StreamExt;
    use serde_json::json;

    fn test_connection() -> (
        Connection,
        futures::channel::mpsc::UnboundedReceiver<Message>,
    ) {
        let (sink, stream) = futures::channel::mpsc::unbounded();
        let connection = Connection::attach(
            ConnectionId::next(),
            "127.0.0.1:9000".parse().expect("addr"),
            Role::Automation,
            sink,
        );
        (connection, stream)
    }

    #[tokio::test]
    async fn test_send_json_reaches_socket() {
        let (connection, mut stream) = test_connection();

        connection
            .send_json(&json!({"type": "pong"}))
            .expect("send");

        let Some(Message::Text(text)) = stream.next().await else {
            panic!("expected text frame");
        };
        assert_eq!(text.as_str(), r#"{"type":"pong"}"#);
    }

    #[tokio::test]
    async fn test_writes_are_ordered() {
        let (connection, mut stream) = test_connection();

        for i in 0..10 {
            connection.send_text(format!("m{i}")).expect("send");
        }

        for i in 0..10 {
            let Some(Message::Text(text)) = stream.next().await else {
                panic!("expected text frame");
            };
            assert_eq!(text.as_str(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn test_close_emits_frame_and_rejects_writes() {
        let (connection, mut stream) = test_connection();

        connection.close(1008, "policy violation");
        assert!(!connection.is_open());
        assert!(connection.send_text("late".to_string()).is_err());

        let Some(Message::Close(Some(frame))) = stream.next().await else {
            panic!("expected close frame");
        };
        assert_eq!(u16::from(frame.code), 1008);
        assert_eq!(frame.reason.as_str(), "policy violation");

        // Writer stops after the close frame.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connection, mut stream) = test_connection();

        connection.close(1000, "bye");
        connection.close(1008, "again");

        let Some(Message::Close(Some(frame))) = stream.next().await else {
            panic!("expected close frame");
        };
        assert_eq!(u16::from(frame.code), 1000);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_session_binding() {
        let (connection, _stream) = test_connection();
        assert!(connection.session_id().is_none());

        let session_id = SessionId::generate();
        connection.bind_session(session_id, ClientId::new("bot-1"));

        assert_eq!(connection.session_id(), Some(session_id));
        assert_eq!(connection.client_id(), Some(ClientId::new("bot-1")));
    }

    #[tokio::test]
    async fn test_activity_bookkeeping() {
        let (connection, _stream) = test_connection();
        assert_eq!(connection.message_count(), 0);

        connection.touch_activity();
        connection.touch_activity();
        connection.touch_pong();

        assert_eq!(connection.message_count(), 2);
        assert!(connection.since_last_pong() < Duration::from_secs(1));
    }
}
