//! Command endpoints and read surface.
//!
//! One POST handler per action, all funneling through
//! [`submit_command`]: validate → rate limit → admission → register
//! callback → correlator. The caller is identified by its remote
//! address; a `callbackUrl` field switches result delivery from polling
//! to an HTTP POST.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::audit::{AuditKind, AuditRecord};
use crate::correlator::{Delivery, Submission};
use crate::error::Error;
use crate::gateway::Gateway;
use crate::identifiers::{ClientId, RequestId};
use crate::protocol::{Action, Command, CommandParams};

use super::error_response;

// ============================================================================
// Constants
// ============================================================================

/// Sentinel callback URL meaning "keep the result for polling".
const INTERNAL_CALLBACK: &str = "_internal";

// ============================================================================
// Command Endpoints
// ============================================================================

/// `POST /api/open_url`
pub async fn open_url(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    submit_command(&gateway, addr, Action::OpenUrl, body)
}

/// `POST /api/close_tab`
pub async fn close_tab(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    submit_command(&gateway, addr, Action::CloseTab, body)
}

/// `POST /api/get_html`
pub async fn get_html(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    submit_command(&gateway, addr, Action::GetHtml, body)
}

/// `POST /api/execute_script`
pub async fn execute_script(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    submit_command(&gateway, addr, Action::ExecuteScript, body)
}

/// `POST /api/inject_css`
pub async fn inject_css(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    submit_command(&gateway, addr, Action::InjectCss, body)
}

/// `POST /api/get_cookies`
pub async fn get_cookies(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    submit_command(&gateway, addr, Action::GetCookies, body)
}

/// `POST /api/upload_file_to_tab`
pub async fn upload_file_to_tab(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Response {
    submit_command(&gateway, addr, Action::UploadFileToTab, body)
}

/// The shared submission path.
fn submit_command(
    gateway: &Arc<Gateway>,
    addr: SocketAddr,
    action: Action,
    body: Value,
) -> Response {
    if gateway.is_shutdown() {
        return error_response(&Error::ShuttingDown);
    }

    // Validate parameters.
    let params: CommandParams = match serde_json::from_value(body.clone()) {
        Ok(params) => params,
        Err(e) => {
            return error_response(&Error::invalid_argument(e.to_string()));
        }
    };
    let command = match Command::new(action, params) {
        Ok(command) => command,
        Err(e) => return error_response(&e),
    };

    // Rate limit (caller identity = remote address) before any work.
    let caller = ClientId::new(addr.ip().to_string());
    if let Err(e) = gateway
        .limiter()
        .check_request(&caller, action.is_sensitive())
    {
        return error_response(&e);
    }

    // Admission before registration.
    if let Err(e) = gateway.monitor().can_accept_request() {
        return error_response(&e);
    }

    let request_id = body
        .get("requestId")
        .and_then(Value::as_str)
        .map(RequestId::new);

    let delivery = match body.get("callbackUrl").and_then(Value::as_str) {
        Some(url) if !url.is_empty() && url != INTERNAL_CALLBACK => {
            Delivery::HttpUrl(url.to_string())
        }
        _ => Delivery::Internal,
    };

    match gateway.correlator().submit(&command, request_id, delivery) {
        Ok(Submission::Dispatched { request_id }) => {
            gateway
                .limiter()
                .record_request(&caller, action.is_sensitive());
            if action.is_sensitive() {
                let mut record = AuditRecord::new(AuditKind::SensitiveAction)
                    .client(caller)
                    .client_type("http")
                    .address(addr)
                    .action(action.as_str())
                    .request(request_id.clone());
                if let Some(tab_id) = command.params.tab_id {
                    record = record.target_tab(tab_id);
                }
                gateway.audit().record(record);
            }
            debug!(%request_id, action = action.as_str(), "HTTP command dispatched");
            Json(json!({
                "status": "pending",
                "requestId": request_id,
                "needsCallback": true,
            }))
            .into_response()
        }
        Ok(Submission::Deduplicated {
            request_id,
            existing,
        }) => {
            gateway
                .limiter()
                .record_request(&caller, action.is_sensitive());
            Json(json!({
                "status": "pending",
                "requestId": request_id,
                "deduplicated": true,
                "existingRequestId": existing,
                "needsCallback": true,
            }))
            .into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Read Surface
// ============================================================================

/// `GET /api/tabs` — last snapshot pushed by an extension.
pub async fn tabs(State(gateway): State<Arc<Gateway>>) -> Response {
    let snapshot = gateway.tab_snapshot();
    Json(json!({
        "status": "success",
        "tabs": snapshot["tabs"],
        "active_tab_id": snapshot["active_tab_id"],
    }))
    .into_response()
}

/// Query parameters for the cookie read surface.
#[derive(Debug, Deserialize)]
pub struct CookieQuery {
    /// Substring match on the cookie domain.
    pub domain: Option<String>,
    /// Exact match on the cookie name.
    pub name: Option<String>,
    /// Page size (default 100).
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

/// `GET /api/cookies?domain&name&limit&offset` — cached cookies from the
/// latest `get_cookies` completion.
pub async fn cookies(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<CookieQuery>,
) -> Response {
    let cookies = gateway.cookies(
        query.domain.as_deref(),
        query.name.as_deref(),
        query.limit.unwrap_or(100),
        query.offset.unwrap_or(0),
    );
    Json(json!({
        "status": "success",
        "count": cookies.len(),
        "cookies": cookies,
    }))
    .into_response()
}
