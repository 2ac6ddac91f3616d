//! Long-poll result delivery.
//!
//! `GET /api/callback_response/{requestId}?wait=<seconds>` returns the
//! terminal payload when one exists, otherwise races a one-shot
//! `callback_result` listener against the bounded wait and answers 202
//! on expiry. Poll pressure is limited per caller and per request.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::gateway::Gateway;
use crate::identifiers::{ClientId, RequestId};

use super::error_response;

// ============================================================================
// WaitQuery
// ============================================================================

/// Query parameters for the long poll.
#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    /// Seconds to wait for a result (clamped to `max_wait_time`).
    pub wait: Option<f64>,
}

// ============================================================================
// Handler
// ============================================================================

/// `GET /api/callback_response/{request_id}`
pub async fn callback_response(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(request_id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let request_id = RequestId::new(request_id);
    let caller = ClientId::new(addr.ip().to_string());

    // Poll limits before any work.
    if let Err(e) = gateway.limiter().check_poll(&caller, &request_id) {
        return error_response(&e);
    }
    gateway.limiter().record_poll(&caller, &request_id);

    // Terminal already? Serve it and clear the per-request poll counter.
    let store = gateway.correlator().store();
    if let Some(payload) = store.terminal_payload(&request_id) {
        gateway.limiter().clear_poll_count(&request_id);
        return Json(payload).into_response();
    }

    // Subscribe before re-checking, so a result landing in between is
    // not missed.
    let mut rx = gateway.bus().subscribe();
    if let Some(payload) = store.terminal_payload(&request_id) {
        gateway.limiter().clear_poll_count(&request_id);
        return Json(payload).into_response();
    }

    let wait = query
        .wait
        .map_or(Duration::ZERO, |w| Duration::from_secs_f64(w.max(0.0)))
        .min(gateway.config().max_wait_time);
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                if event.is_callback_result() && event.request_id.as_ref() == Some(&request_id) {
                    gateway.limiter().clear_poll_count(&request_id);
                    return Json(event.data).into_response();
                }
            }
            // Lagged: fall back to the store before giving up.
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if let Some(payload) = store.terminal_payload(&request_id) {
        gateway.limiter().clear_poll_count(&request_id);
        return Json(payload).into_response();
    }

    debug!(%request_id, "Long poll expired without result");
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "pending",
            "requestId": request_id,
        })),
    )
        .into_response()
}
