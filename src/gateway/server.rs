//! WebSocket front end: accept loop, admission gates, read loops.
//!
//! Admission order for every socket:
//!
//! 1. Upgrade (capturing `Origin` and the `type` query parameter)
//! 2. Origin whitelist → close 1008
//! 3. Address lockout → close 1008 before any challenge
//! 4. Auth handshake → close 1008 on failure
//! 5. Extension capacity (one cleanup pass first) → close 1013
//! 6. Hub registration, then the role-specific read loop
//!
//! Closing removes the connection from its hub before the asynchronous
//! audit write.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditKind, AuditRecord};
use crate::auth::Role;
use crate::correlator::Delivery;
use crate::error::{Error, Result};
use crate::events::BusEvent;
use crate::identifiers::{ClientId, ConnectionId, RequestId};
use crate::protocol::{Action, AutomationRequest, ExtensionMessage, notify};

use super::{Connection, Gateway};

// ============================================================================
// Constants
// ============================================================================

/// Accept poll slice, so the loop observes the shutdown flag promptly.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Grace between a `session_expired` event and the close frame.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Accept Loop
// ============================================================================

/// Background task accepting WebSocket connections.
pub async fn accept_loop(gateway: Arc<Gateway>, listener: TcpListener) {
    debug!("WS accept loop started");

    loop {
        if gateway.is_shutdown() {
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    if let Err(e) = handle_socket(gateway, stream, addr).await {
                        debug!(%addr, error = %e, "Connection ended with error");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "Accept failed");
            }
            Err(_) => continue,
        }
    }

    debug!("WS accept loop terminated");
}

// ============================================================================
// Per-Socket Admission
// ============================================================================

/// Upgrades one socket and runs it through the admission gates.
async fn handle_socket(
    gateway: Arc<Gateway>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let mut origin: Option<String> = None;
    let mut role = Role::Extension;

    let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        origin = req
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let type_param = req.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "type")
                .map(|(_, value)| value.into_owned())
        });
        role = Role::from_query(type_param.as_deref());

        Ok(resp)
    })
    .await
    .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    debug!(%addr, role = role.as_str(), ?origin, "WebSocket connection established");

    // Origin whitelist.
    if !gateway.config().origin_allowed(origin.as_deref()) {
        gateway.audit().record(
            AuditRecord::new(AuditKind::ConnectionRejected)
                .client_type(role.as_str())
                .address(addr)
                .details(serde_json::json!({
                    "reason": "origin",
                    "origin": origin.as_deref().unwrap_or("null"),
                })),
        );
        close_stream(&mut ws, 1008, "Origin not allowed").await;
        return Ok(());
    }

    // Lockout check, before any challenge is sent.
    if let Some(remaining) = gateway.limiter().locked_for(addr.ip()) {
        gateway.audit().record(
            AuditRecord::new(AuditKind::ConnectionRejected)
                .client_type(role.as_str())
                .address(addr)
                .details(serde_json::json!({"reason": "locked"})),
        );
        let reason = format!("Address locked, retry after {}s", remaining.as_secs().max(1));
        close_stream(&mut ws, 1008, &reason).await;
        return Ok(());
    }

    // Auth handshake.
    let connection_id = ConnectionId::next();
    let session = if gateway.config().auth_enabled {
        match super::handshake::authenticate(&gateway, &mut ws, connection_id, addr, role).await
        {
            Ok(session) => Some(session),
            Err(e) => {
                let code = e.close_code().unwrap_or(1008);
                close_stream(&mut ws, code, "Authentication failed").await;
                return Ok(());
            }
        }
    } else {
        None
    };

    // Extension capacity, with one cleanup pass before rejecting.
    if role == Role::Extension {
        let max = gateway.config().max_clients;
        if gateway.extensions().count() >= max {
            let _ = gateway.extensions().cleanup_dead();
        }
        let active = gateway.extensions().count();
        if active >= max {
            gateway.audit().record(
                AuditRecord::new(AuditKind::ConnectionRejected)
                    .client_type(role.as_str())
                    .address(addr)
                    .details(serde_json::json!({"reason": "capacity", "active": active})),
            );
            close_stream(&mut ws, 1013, "Extension capacity reached").await;
            return Ok(());
        }
    }

    // Admission: split the stream, build the handle, register with the
    // role's hub. Frames queued during the handshake stay in the read
    // half, so nothing is lost by the dispatch swap.
    let (sink, read) = ws.split();
    let connection = Connection::attach(connection_id, addr, role, sink);
    if let Some(ref session) = session {
        connection.bind_session(session.id, session.client_id.clone());
    }

    match role {
        Role::Extension => gateway.extensions().register(connection.clone()),
        Role::Automation => gateway.clients().register(connection.clone()),
    }

    let mut admitted = AuditRecord::new(AuditKind::ConnectionAdmitted)
        .client_type(role.as_str())
        .address(addr);
    if let Some(ref session) = session {
        admitted = admitted.session(session.id);
    }
    gateway.audit().record(admitted);
    info!(%connection_id, %addr, role = role.as_str(), "Connection admitted");

    // Role-specific read loop until the socket drops.
    match role {
        Role::Extension => run_extension_loop(&gateway, &connection, read).await,
        Role::Automation => run_automation_loop(&gateway, &connection, read).await,
    }

    // Removal precedes the audit write.
    match role {
        Role::Extension => {
            let _ = gateway.extensions().remove(connection_id);
        }
        Role::Automation => {
            let _ = gateway.clients().remove(connection_id);
        }
    }
    if let Some(session) = session {
        gateway.auth().sessions().remove(session.id);
    }
    connection.close(1000, "");

    gateway.audit().record(
        AuditRecord::new(AuditKind::ConnectionClosed)
            .client_type(role.as_str())
            .address(addr),
    );
    debug!(%connection_id, "Connection closed");
    Ok(())
}

/// Sends a close frame on an unsplit stream, ignoring failures.
async fn close_stream(ws: &mut WebSocketStream<TcpStream>, code: u16, reason: &str) {
    use futures_util::SinkExt;
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws.send(Message::Close(Some(frame))).await;
    let _ = ws.close(None).await;
}

// ============================================================================
// Extension Read Loop
// ============================================================================

/// Reads and dispatches frames from an admitted extension.
async fn run_extension_loop(
    gateway: &Arc<Gateway>,
    connection: &Connection,
    mut read: SplitStream<WebSocketStream<TcpStream>>,
) {
    while let Some(frame) = read.next().await {
        if gateway.is_shutdown() {
            break;
        }
        match frame {
            Ok(Message::Text(text)) => {
                connection.touch_activity();
                dispatch_extension_message(gateway, connection, text.as_str());
            }
            Ok(Message::Pong(_)) => connection.touch_pong(),
            Ok(Message::Ping(payload)) => connection.send_pong(payload.to_vec()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection.id(), error = %e, "Extension read error");
                break;
            }
        }
    }
}

/// Dispatches one extension text frame.
fn dispatch_extension_message(gateway: &Arc<Gateway>, connection: &Connection, text: &str) {
    let message = match ExtensionMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            let _ = connection.send_json(&notify::protocol_error(
                None,
                "bad_message",
                &e.to_string(),
            ));
            return;
        }
    };

    // Messages bearing a session must hit a live one. Completion-shaped
    // follow-ups are silently dropped instead of bounced, to avoid
    // breaking a request chain already in flight.
    if gateway.config().auth_enabled {
        if let Some(session_id) = message.session_id() {
            if gateway.auth().sessions().validate(session_id).is_err() {
                if message.is_completion_shaped() {
                    warn!(%session_id, "Completion with invalid session dropped");
                } else {
                    let _ = connection.send_json(&notify::session_expired());
                    schedule_close(connection.clone(), 1001, "Session expired");
                }
                return;
            }
            gateway.auth().sessions().touch(session_id);
        } else if let Some(session_id) = connection.session_id() {
            gateway.auth().sessions().touch(session_id);
        }
    }

    match message {
        ExtensionMessage::Ping => {
            let _ = connection.send_json(&notify::pong());
        }
        ExtensionMessage::Pong => {}
        ExtensionMessage::Init(payload) => {
            let config = gateway.config();
            let _ = connection.send_json(&notify::init_ack(
                config.request_timeout.as_millis() as u64,
                config.heartbeat_interval.as_millis() as u64,
                config.heartbeat_timeout.as_millis() as u64,
                config.rate.global_limit,
                config.rate.window.as_millis() as u64,
            ));
            gateway
                .bus()
                .publish(BusEvent::named("init", payload.into_data()));
        }
        ExtensionMessage::Data {
            tabs,
            active_tab_id,
        } => {
            gateway.update_snapshot(tabs.clone(), active_tab_id);
            gateway.bus().publish(BusEvent::named(
                "tabs_update",
                serde_json::json!({"tabs": tabs, "active_tab_id": active_tab_id}),
            ));
        }
        ExtensionMessage::TabHtmlChunk {
            request_id,
            chunk_index,
            chunk_data,
            total_chunks,
        } => {
            gateway
                .correlator()
                .on_chunk(&request_id, chunk_index, chunk_data, total_chunks);
        }
        ExtensionMessage::Error {
            request_id,
            message,
            code,
        } => match request_id {
            Some(request_id) => {
                gateway
                    .correlator()
                    .on_error(&request_id, &message, code.as_deref());
            }
            None => warn!(%message, "Uncorrelated extension error"),
        },
        completion => {
            // Every remaining variant is a *_complete.
            let Some(request_id) = completion.request_id().cloned() else {
                let _ = connection.send_json(&notify::protocol_error(
                    None,
                    "missing_request_id",
                    "completion without requestId",
                ));
                return;
            };

            // Keep the cookie cache current for the HTTP read surface.
            if let ExtensionMessage::GetCookiesComplete(ref payload) = completion {
                if let Some(cookies) = payload.data.get("cookies").and_then(|v| v.as_array()) {
                    gateway.update_cookies(cookies.clone());
                }
            }

            let data = match completion {
                ExtensionMessage::OpenUrlComplete(p)
                | ExtensionMessage::CloseTabComplete(p)
                | ExtensionMessage::TabHtmlComplete(p)
                | ExtensionMessage::ExecuteScriptComplete(p)
                | ExtensionMessage::InjectCssComplete(p)
                | ExtensionMessage::GetCookiesComplete(p)
                | ExtensionMessage::UploadFileToTabComplete(p) => p.into_data(),
                _ => unreachable!("non-completion variants handled above"),
            };

            gateway.correlator().on_complete(&request_id, data);
        }
    }
}

// ============================================================================
// Automation Read Loop
// ============================================================================

/// Reads and dispatches frames from an admitted automation client.
async fn run_automation_loop(
    gateway: &Arc<Gateway>,
    connection: &Connection,
    mut read: SplitStream<WebSocketStream<TcpStream>>,
) {
    while let Some(frame) = read.next().await {
        if gateway.is_shutdown() {
            break;
        }
        match frame {
            Ok(Message::Text(text)) => {
                connection.touch_activity();
                dispatch_automation_request(gateway, connection, text.as_str());
            }
            Ok(Message::Pong(_)) => connection.touch_pong(),
            Ok(Message::Ping(payload)) => connection.send_pong(payload.to_vec()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection.id(), error = %e, "Automation read error");
                break;
            }
        }
    }
}

/// Dispatches one automation request envelope.
fn dispatch_automation_request(gateway: &Arc<Gateway>, connection: &Connection, text: &str) {
    let request = match AutomationRequest::parse(text) {
        Ok(request) => request,
        Err(e) => {
            let _ = connection.send_json(&notify::protocol_error(
                None,
                "bad_envelope",
                &e.to_string(),
            ));
            return;
        }
    };
    let request_id = request.request_id.clone();

    // Session validation: new requests on a dead session are refused;
    // requests already in flight ride to their terminal state untouched.
    if gateway.config().auth_enabled {
        let session_id = request.session_id.or_else(|| connection.session_id());
        let live = session_id
            .is_some_and(|id| gateway.auth().sessions().validate(id).is_ok());
        if !live {
            let _ = connection.send_json(&notify::session_expired());
            schedule_close(connection.clone(), 1001, "Session expired");
            return;
        }
        if let Some(id) = session_id {
            gateway.auth().sessions().touch(id);
        }
    }

    let (_, _, command) = match request.into_command() {
        Ok(parts) => parts,
        Err(e) => {
            let code = match e {
                Error::UnknownAction { .. } => "unknown_action",
                _ => "invalid_argument",
            };
            let _ = connection.send_json(&notify::protocol_error(
                request_id.as_ref(),
                code,
                &e.to_string(),
            ));
            return;
        }
    };

    let action = command.action;
    let caller = connection
        .client_id()
        .unwrap_or_else(|| ClientId::new(connection.addr().to_string()));
    let response_id = request_id.clone().unwrap_or_else(RequestId::generate);

    // Rate limiting before any work is spawned or registered.
    if let Err(e) = gateway.limiter().check_request(&caller, action.is_sensitive()) {
        let _ = connection.send_json(&notify::error(action, &response_id, &e.to_string()));
        return;
    }

    // Local actions never touch the extension.
    match action {
        Action::SubscribeEvents => {
            let events = command.params.events.unwrap_or_default();
            let accepted = gateway.clients().subscribe(connection.id(), &events);
            gateway.limiter().record_request(&caller, false);
            let _ = connection.send_json(&notify::success(
                action,
                &response_id,
                serde_json::json!({"events": accepted}),
            ));
            return;
        }
        Action::UnsubscribeEvents => {
            let events = command.params.events.unwrap_or_default();
            gateway.clients().unsubscribe(connection.id(), &events);
            gateway.limiter().record_request(&caller, false);
            let _ = connection.send_json(&notify::success(
                action,
                &response_id,
                serde_json::json!({"events": events}),
            ));
            return;
        }
        Action::GetTabs => {
            gateway.limiter().record_request(&caller, false);
            let _ = connection.send_json(&notify::success(
                action,
                &response_id,
                gateway.tab_snapshot(),
            ));
            return;
        }
        _ => {}
    }

    // Admission control before registration.
    if let Err(e) = gateway.monitor().can_accept_request() {
        let _ = connection.send_json(&notify::error(action, &response_id, &e.to_string()));
        return;
    }

    match gateway.correlator().submit(
        &command,
        request_id,
        Delivery::WebSocket(connection.id()),
    ) {
        Ok(crate::correlator::Submission::Dispatched { request_id }) => {
            gateway
                .limiter()
                .record_request(&caller, action.is_sensitive());
            if action.is_sensitive() {
                let mut record = AuditRecord::new(AuditKind::SensitiveAction)
                    .client(caller)
                    .client_type("automation")
                    .address(connection.addr())
                    .action(action.as_str())
                    .request(request_id);
                if let Some(session_id) = connection.session_id() {
                    record = record.session(session_id);
                }
                if let Some(tab_id) = command.params.tab_id {
                    record = record.target_tab(tab_id);
                }
                gateway.audit().record(record);
            }
            // The typed response arrives with the terminal push.
        }
        Ok(crate::correlator::Submission::Deduplicated {
            request_id,
            existing,
        }) => {
            gateway
                .limiter()
                .record_request(&caller, action.is_sensitive());
            let _ =
                connection.send_json(&notify::deduplicated(action, &request_id, &existing));
        }
        Err(e) => {
            let _ = connection.send_json(&notify::error(action, &response_id, &e.to_string()));
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Closes a connection after the session grace period.
fn schedule_close(connection: Connection, code: u16, reason: &'static str) {
    tokio::spawn(async move {
        tokio::time::sleep(SESSION_CLOSE_GRACE).await;
        connection.close(code, reason);
    });
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::SinkExt;
    use serde_json::{Value, json};
    use tokio_tungstenite::MaybeTlsStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    use crate::auth::{AuthManager, SharedSecret};
    use crate::config::GatewayConfig;

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const TEST_SECRET: &str = "deadbeefcafebabe";

    async fn start_gateway(config: GatewayConfig) -> Arc<Gateway> {
        Gateway::start(config.with_secret(TEST_SECRET))
            .await
            .expect("gateway start")
    }

    async fn connect(gateway: &Gateway, role: &str) -> ClientWs {
        let url = format!("ws://{}/?type={role}", gateway.ws_addr());
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("connect");
        ws
    }

    async fn next_json(ws: &mut ClientWs) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("json");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Completes the handshake with the shared test secret.
    async fn authenticate(ws: &mut ClientWs, client_id: &str) -> Value {
        let challenge = next_json(ws).await;
        assert_eq!(challenge["type"], "auth_challenge");

        let token = challenge["challenge"].as_str().expect("challenge");
        let response = AuthManager::sign_challenge(
            &SharedSecret::from_string(TEST_SECRET),
            token,
        );

        ws.send(Message::Text(
            json!({"type": "auth_response", "response": response, "clientId": client_id})
                .to_string()
                .into(),
        ))
        .await
        .expect("send auth_response");

        let result = next_json(ws).await;
        assert_eq!(result["type"], "auth_result");
        result
    }

    async fn expect_close(ws: &mut ClientWs) -> Option<u16> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| u16::from(f.code));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_issues_session() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;
        let mut ws = connect(&gateway, "automation").await;

        let result = authenticate(&mut ws, "bot-1").await;
        assert_eq!(result["success"], true);
        assert!(result["sessionId"].is_string());
        assert!(result["expiresIn"].as_u64().expect("ttl") > 0);
        assert!(
            result["permissions"]
                .as_array()
                .expect("permissions")
                .iter()
                .any(|p| p == "open_url")
        );

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_response_rejected() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;
        let mut ws = connect(&gateway, "automation").await;

        let challenge = next_json(&mut ws).await;
        assert_eq!(challenge["type"], "auth_challenge");

        ws.send(Message::Text(
            json!({"type": "auth_response", "response": hex::encode([0u8; 32])})
                .to_string()
                .into(),
        ))
        .await
        .expect("send");

        let result = next_json(&mut ws).await;
        assert_eq!(result["success"], false);
        assert_eq!(expect_close(&mut ws).await, Some(1008));

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_scenario_a_open_url_happy_path() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        // Extension connects and authenticates.
        let mut ext = connect(&gateway, "extension").await;
        let ext_result = authenticate(&mut ext, "ext-1").await;
        assert_eq!(ext_result["success"], true);

        // Automation connects and authenticates.
        let mut bot = connect(&gateway, "automation").await;
        let bot_result = authenticate(&mut bot, "bot-1").await;
        let session_id = bot_result["sessionId"].as_str().expect("session");

        // Automation submits open_url.
        bot.send(Message::Text(
            json!({
                "sessionId": session_id,
                "requestId": "r1",
                "action": "open_url",
                "url": "https://example.org",
                "tabId": null,
            })
            .to_string()
            .into(),
        ))
        .await
        .expect("send request");

        // The extension receives the command envelope.
        let envelope = next_json(&mut ext).await;
        assert_eq!(envelope["type"], "open_url");
        assert_eq!(envelope["requestId"], "r1");
        assert_eq!(envelope["url"], "https://example.org");

        // The extension completes the command.
        ext.send(Message::Text(
            json!({
                "type": "open_url_complete",
                "requestId": "r1",
                "tabId": 7,
                "url": "https://example.org",
                "cookies": [],
            })
            .to_string()
            .into(),
        ))
        .await
        .expect("send completion");

        // Automation receives the typed response.
        let response = next_json(&mut bot).await;
        assert_eq!(response["type"], "open_url_response");
        assert_eq!(response["requestId"], "r1");
        assert_eq!(response["status"], "success");
        assert_eq!(response["data"]["tabId"], 7);

        // The store retains the completed entry.
        let entry = gateway
            .correlator()
            .store()
            .get(&RequestId::new("r1"))
            .expect("entry");
        assert!(entry.status.is_terminal());
        assert!(entry.ws_pushed);

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_scenario_b_dedup_over_ws() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        let mut ext = connect(&gateway, "extension").await;
        authenticate(&mut ext, "ext-1").await;
        let mut bot = connect(&gateway, "automation").await;
        let result = authenticate(&mut bot, "bot-1").await;
        let session_id = result["sessionId"].as_str().expect("session").to_string();

        let request = |rid: &str| {
            json!({
                "sessionId": session_id,
                "requestId": rid,
                "action": "open_url",
                "url": "https://example.org",
                "tabId": null,
            })
            .to_string()
        };

        bot.send(Message::Text(request("r1").into())).await.expect("send");
        // The first request reaches the extension.
        let envelope = next_json(&mut ext).await;
        assert_eq!(envelope["requestId"], "r1");

        // 100 ms later the identical request folds onto r1.
        tokio::time::sleep(Duration::from_millis(100)).await;
        bot.send(Message::Text(request("r2").into())).await.expect("send");

        let response = next_json(&mut bot).await;
        assert_eq!(response["status"], "pending");
        assert_eq!(response["deduplicated"], true);
        assert_eq!(response["existingRequestId"], "r1");

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_scenario_d_lockout() {
        let mut config = GatewayConfig::for_tests();
        config.rate.max_failed_attempts = 5;
        config.rate.lockout_duration = Duration::from_secs(60);
        let gateway = start_gateway(config).await;

        // Five failed handshakes from this address.
        for _ in 0..5 {
            let mut ws = connect(&gateway, "automation").await;
            let _ = next_json(&mut ws).await;
            ws.send(Message::Text(
                json!({"type": "auth_response", "response": hex::encode([0u8; 32])})
                    .to_string()
                    .into(),
            ))
            .await
            .expect("send");
            let _ = expect_close(&mut ws).await;
        }

        // The sixth connect is closed with 1008 before any challenge.
        let mut ws = connect(&gateway, "automation").await;
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1008);
                assert!(frame.reason.as_str().contains("locked"));
            }
            other => panic!("expected immediate close, got {other:?}"),
        }

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_origin_rejected() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        let mut request = format!("ws://{}/?type=automation", gateway.ws_addr())
            .into_client_request()
            .expect("request");
        request
            .headers_mut()
            .insert("origin", "https://evil.example".parse().expect("header"));

        let (mut ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("connect");
        assert_eq!(expect_close(&mut ws).await, Some(1008));

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_extension_capacity() {
        let mut config = GatewayConfig::for_tests();
        config.max_clients = 1;
        let gateway = start_gateway(config).await;

        let mut first = connect(&gateway, "extension").await;
        authenticate(&mut first, "ext-1").await;

        let mut second = connect(&gateway, "extension").await;
        authenticate(&mut second, "ext-2").await;
        assert_eq!(expect_close(&mut second).await, Some(1013));

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_action_is_protocol_error() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;
        let mut bot = connect(&gateway, "automation").await;
        let result = authenticate(&mut bot, "bot-1").await;
        let session_id = result["sessionId"].as_str().expect("session");

        bot.send(Message::Text(
            json!({"sessionId": session_id, "requestId": "r1", "action": "fly_away"})
                .to_string()
                .into(),
        ))
        .await
        .expect("send");

        let response = next_json(&mut bot).await;
        assert_eq!(response["type"], "error");
        assert_eq!(response["code"], "unknown_action");
        assert_eq!(response["requestId"], "r1");

        // The connection survives protocol errors.
        bot.send(Message::Text(json!({"sessionId": session_id, "action": "get_tabs"}).to_string().into()))
            .await
            .expect("send");
        let response = next_json(&mut bot).await;
        assert_eq!(response["type"], "get_tabs_response");

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_get_tabs_served_from_snapshot() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        let mut ext = connect(&gateway, "extension").await;
        authenticate(&mut ext, "ext-1").await;
        ext.send(Message::Text(
            json!({
                "type": "data",
                "tabs": [{"id": 1, "url": "https://example.org"}],
                "active_tab_id": 1,
            })
            .to_string()
            .into(),
        ))
        .await
        .expect("send snapshot");

        let mut bot = connect(&gateway, "automation").await;
        let result = authenticate(&mut bot, "bot-1").await;
        let session_id = result["sessionId"].as_str().expect("session");

        // Allow the snapshot to land.
        tokio::time::sleep(Duration::from_millis(100)).await;

        bot.send(Message::Text(
            json!({"sessionId": session_id, "requestId": "r1", "action": "get_tabs"})
                .to_string()
                .into(),
        ))
        .await
        .expect("send");

        let response = next_json(&mut bot).await;
        assert_eq!(response["status"], "success");
        assert_eq!(response["data"]["tabs"][0]["id"], 1);
        assert_eq!(response["data"]["active_tab_id"], 1);

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_scenario_e_html_streaming() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        let mut ext = connect(&gateway, "extension").await;
        authenticate(&mut ext, "ext-1").await;
        let mut bot = connect(&gateway, "automation").await;
        let result = authenticate(&mut bot, "bot-1").await;
        let session_id = result["sessionId"].as_str().expect("session");

        bot.send(Message::Text(
            json!({"sessionId": session_id, "requestId": "r1", "action": "get_html", "tabId": 3})
                .to_string()
                .into(),
        ))
        .await
        .expect("send");
        let _ = next_json(&mut ext).await;

        // Chunks arrive permuted: 2, 0, 1, 4, 3.
        for index in [2, 0, 1, 4, 3] {
            ext.send(Message::Text(
                json!({
                    "type": "tab_html_chunk",
                    "requestId": "r1",
                    "chunk_index": index,
                    "chunk_data": format!("<part{index}/>"),
                    "total_chunks": 5,
                })
                .to_string()
                .into(),
            ))
            .await
            .expect("send chunk");
        }
        ext.send(Message::Text(
            json!({"type": "tab_html_complete", "requestId": "r1", "tabId": 3})
                .to_string()
                .into(),
        ))
        .await
        .expect("send complete");

        let response = next_json(&mut bot).await;
        assert_eq!(response["type"], "get_html_response");
        assert_eq!(
            response["data"]["html"],
            "<part0/><part1/><part2/><part3/><part4/>"
        );

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sockets_with_1000() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        let mut ext = connect(&gateway, "extension").await;
        authenticate(&mut ext, "ext-1").await;
        let mut bot = connect(&gateway, "automation").await;
        authenticate(&mut bot, "bot-1").await;

        gateway.shutdown();

        assert_eq!(expect_close(&mut ext).await, Some(1000));
        assert_eq!(expect_close(&mut bot).await, Some(1000));

        // Every table was cleared and no request timer is scheduled.
        assert_eq!(gateway.correlator().pending_count(), 0);
        assert_eq!(gateway.correlator().store().count(), 0);
        assert_eq!(gateway.auth().sessions().count(), 0);
        assert_eq!(gateway.auth().challenges().count(), 0);
    }

    #[tokio::test]
    async fn test_init_gets_init_ack() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        let mut ext = connect(&gateway, "extension").await;
        authenticate(&mut ext, "ext-1").await;

        ext.send(Message::Text(json!({"type": "init"}).to_string().into()))
            .await
            .expect("send init");

        let ack = next_json(&mut ext).await;
        assert_eq!(ack["type"], "init_ack");
        assert_eq!(ack["config"]["request"]["defaultTimeout"], 60_000);
        assert!(ack["config"]["heartbeat"]["interval"].is_number());
        assert_eq!(ack["config"]["rateLimit"]["limit"], 300);

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_wrapped_carrier_completion() {
        let gateway = start_gateway(GatewayConfig::for_tests()).await;

        let mut ext = connect(&gateway, "extension").await;
        authenticate(&mut ext, "ext-1").await;
        let mut bot = connect(&gateway, "automation").await;
        let result = authenticate(&mut bot, "bot-1").await;
        let session_id = result["sessionId"].as_str().expect("session");

        bot.send(Message::Text(
            json!({
                "sessionId": session_id,
                "requestId": "r1",
                "action": "execute_script",
                "tabId": 7,
                "code": "document.title",
            })
            .to_string()
            .into(),
        ))
        .await
        .expect("send");
        let _ = next_json(&mut ext).await;

        // The wrapped carrier shape unwraps to the bare completion.
        ext.send(Message::Text(
            json!({
                "type": "request",
                "action": "execute_script_complete",
                "requestId": "r1",
                "payload": {"result": "Example Domain"},
            })
            .to_string()
            .into(),
        ))
        .await
        .expect("send wrapped completion");

        let response = next_json(&mut bot).await;
        assert_eq!(response["type"], "execute_script_response");
        assert_eq!(response["data"]["result"], "Example Domain");

        gateway.shutdown();
    }
}
