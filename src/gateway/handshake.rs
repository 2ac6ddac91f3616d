//! Challenge/response handshake over a fresh socket.
//!
//! Runs on the unsplit stream immediately after the WebSocket upgrade,
//! before the connection handle exists:
//!
//! ```text
//! AWAIT_CHALLENGE_SENT → AWAIT_RESPONSE → VERIFY → (ADMITTED | REJECTED)
//! ```
//!
//! Because the same stream is handed to the role-specific read loop
//! afterwards, messages that arrive while `auth_result` is in flight
//! stay queued in the stream and are never lost by the handler swap.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::audit::{AuditKind, AuditRecord};
use crate::auth::{Role, Session};
use crate::config::SERVER_VERSION;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{AuthChallenge, AuthResponse, AuthResult};

use super::Gateway;

// ============================================================================
// Constants
// ============================================================================

/// Pause between a rejection result and the close frame, so the client
/// reads the reason before the socket drops.
const REJECT_GRACE: Duration = Duration::from_millis(100);

// ============================================================================
// Handshake
// ============================================================================

/// Runs the challenge/response handshake and issues a session.
///
/// # Errors
///
/// - [`Error::ChallengeExpired`] when the client never answered in time
/// - [`Error::AuthFailed`] on a bad response (failure recorded with the
///   rate limiter, `auth_result` already sent)
/// - [`Error::ConnectionClosed`] when the socket dropped mid-handshake
pub async fn authenticate(
    gateway: &Gateway,
    stream: &mut WebSocketStream<TcpStream>,
    connection_id: ConnectionId,
    addr: SocketAddr,
    role: Role,
) -> Result<Session> {
    let auth = gateway.auth();
    let config = gateway.config();

    // AWAIT_CHALLENGE_SENT → AWAIT_RESPONSE
    let token = auth
        .challenges()
        .issue(connection_id, config.challenge_timeout);
    let challenge = AuthChallenge::new(token, SERVER_VERSION);
    stream
        .send(Message::Text(serde_json::to_string(&challenge)?.into()))
        .await?;

    // AWAIT_RESPONSE, bounded by the challenge timer.
    let response = match timeout(config.challenge_timeout, read_auth_response(stream)).await {
        Ok(result) => result?,
        Err(_) => {
            auth.challenges().forget(connection_id);
            debug!(%connection_id, "Challenge timed out");
            return Err(Error::ChallengeExpired);
        }
    };

    // VERIFY (one-shot: the challenge is consumed either way).
    match auth.verify(connection_id, &response.response) {
        Ok(()) => {
            let session = auth.admit(response.client_id, role, config.session_ttl);

            let result = AuthResult::granted(
                session.id,
                session.expires_in(tokio::time::Instant::now()).as_secs(),
                session.permissions.to_vec(),
            );
            stream
                .send(Message::Text(serde_json::to_string(&result)?.into()))
                .await?;

            gateway.audit().record(
                AuditRecord::new(AuditKind::AuthSuccess)
                    .session(session.id)
                    .client(session.client_id.clone())
                    .client_type(role.as_str())
                    .address(addr),
            );
            Ok(session)
        }
        Err(e) => {
            let lock = gateway.limiter().record_auth_failure(addr.ip());
            if let Some(duration) = lock {
                gateway.audit().record(
                    AuditRecord::new(AuditKind::AuthLockout)
                        .address(addr)
                        .details(serde_json::json!({"lockoutSecs": duration.as_secs()})),
                );
            }
            gateway.audit().record(
                AuditRecord::new(AuditKind::AuthFailure)
                    .client_type(role.as_str())
                    .address(addr)
                    .details(serde_json::json!({"reason": e.to_string()})),
            );

            let result =
                AuthResult::rejected("Authentication failed", lock.map(|d| d.as_secs()));
            let _ = stream
                .send(Message::Text(serde_json::to_string(&result)?.into()))
                .await;
            tokio::time::sleep(REJECT_GRACE).await;

            warn!(%connection_id, %addr, "Handshake rejected");
            Err(e)
        }
    }
}

/// Reads frames until an `auth_response` text frame arrives.
///
/// Control frames are tolerated; any other text frame is a protocol
/// error.
async fn read_auth_response(stream: &mut WebSocketStream<TcpStream>) -> Result<AuthResponse> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return AuthResponse::parse(text.as_str()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Err(Error::ConnectionClosed),
            Some(Ok(_)) => return Err(Error::protocol("unexpected frame during handshake")),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
