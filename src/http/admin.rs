//! Health, status, config, and the local-only admin surface.
//!
//! `/api/admin/cleanup` and `/api/auth/secret` answer only loopback
//! callers; everything else is public read-only.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::info;

use crate::config::SERVER_VERSION;
use crate::gateway::Gateway;
use crate::monitor::HealthStatus;

// ============================================================================
// Health
// ============================================================================

/// `GET /api/health` — 200 while healthy or warning, 503 when critical.
pub async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let snapshot = gateway.monitor().check();
    let status = match snapshot.status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(json!(snapshot))).into_response()
}

// ============================================================================
// Status
// ============================================================================

/// `GET /api/status` — live component counters.
pub async fn status(State(gateway): State<Arc<Gateway>>) -> Response {
    Json(json!({
        "version": SERVER_VERSION,
        "extensions": gateway.extensions().count(),
        "clients": gateway.clients().count(),
        "sessions": gateway.auth().sessions().count(),
        "pending": gateway.correlator().pending_count(),
        "stored": gateway.correlator().store().count(),
        "dedup": gateway.correlator().dedup_count(),
        "streams": gateway.correlator().stream_count(),
        "lockedAddresses": gateway.limiter().locked_count(),
        "shuttingDown": gateway.is_shutdown(),
    }))
    .into_response()
}

// ============================================================================
// Config
// ============================================================================

/// `GET /api/config` — public configuration, secrets excluded.
pub async fn config(State(gateway): State<Arc<Gateway>>) -> Response {
    let config = gateway.config();
    Json(json!({
        "version": SERVER_VERSION,
        "authEnabled": config.auth_enabled,
        "maxClients": config.max_clients,
        "maxPendingResponses": config.max_pending_responses,
        "requestTimeoutMs": config.request_timeout.as_millis() as u64,
        "dedupWindowMs": config.dedup_window.as_millis() as u64,
        "responseRetentionMs": config.response_retention.as_millis() as u64,
        "heartbeatIntervalMs": config.heartbeat_interval.as_millis() as u64,
        "heartbeatTimeoutMs": config.heartbeat_timeout.as_millis() as u64,
        "sessionTtlSecs": config.session_ttl.as_secs(),
        "rateLimit": {
            "globalLimit": config.rate.global_limit,
            "sensitiveLimit": config.rate.sensitive_limit,
            "windowMs": config.rate.window.as_millis() as u64,
        },
    }))
    .into_response()
}

// ============================================================================
// Admin (local only)
// ============================================================================

/// `POST /api/admin/cleanup` — run every sweep immediately.
pub async fn cleanup(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !addr.ip().is_loopback() {
        return (StatusCode::FORBIDDEN, Json(json!({"status": "error"}))).into_response();
    }

    info!(%addr, "Manual cleanup triggered");
    gateway.correlator().sweep_timeouts();
    gateway
        .correlator()
        .sweep_retention(gateway.config().response_retention);
    gateway.correlator().sweep_dedup();
    gateway.auth().challenges().purge_expired();
    gateway.limiter().purge_expired();

    Json(json!({
        "status": "success",
        "pending": gateway.correlator().pending_count(),
        "stored": gateway.correlator().store().count(),
    }))
    .into_response()
}

/// `GET /api/auth/secret` — shared secret for local tooling.
pub async fn secret(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !addr.ip().is_loopback() {
        return (StatusCode::FORBIDDEN, Json(json!({"status": "error"}))).into_response();
    }

    Json(json!({"secret": gateway.auth().secret_hex()})).into_response()
}
