//! HTTP front end.
//!
//! Mirrors the command set as request/response over `/api/…`: one POST
//! endpoint per action, long-poll and SSE for asynchronous results, and
//! the health/status/admin surface. The front end is a thin adapter —
//! every command goes through the same correlator as the WebSocket
//! path, with the caller identified by its remote address.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `handlers` | POST per action, tab and cookie reads |
//! | `longpoll` | `GET /api/callback_response/{requestId}` |
//! | `sse` | `GET /api/events` stream |
//! | `admin` | Health, status, config, local-only admin |

// ============================================================================
// Submodules
// ============================================================================

/// Command endpoints and reads.
pub mod handlers;

/// Long-poll result delivery.
pub mod longpoll;

/// Server-sent events.
pub mod sse;

/// Health, status, and admin surface.
pub mod admin;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::gateway::Gateway;

// ============================================================================
// Router
// ============================================================================

/// Builds the HTTP router over the gateway instance.
#[must_use]
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        // Command endpoints.
        .route("/api/open_url", post(handlers::open_url))
        .route("/api/close_tab", post(handlers::close_tab))
        .route("/api/get_html", post(handlers::get_html))
        .route("/api/execute_script", post(handlers::execute_script))
        .route("/api/inject_css", post(handlers::inject_css))
        .route("/api/get_cookies", post(handlers::get_cookies))
        .route("/api/upload_file_to_tab", post(handlers::upload_file_to_tab))
        // Reads.
        .route("/api/tabs", get(handlers::tabs))
        .route("/api/cookies", get(handlers::cookies))
        // Result delivery.
        .route(
            "/api/callback_response/{request_id}",
            get(longpoll::callback_response),
        )
        .route("/api/events", get(sse::events))
        // Health and admin.
        .route("/api/health", get(admin::health))
        .route("/api/status", get(admin::status))
        .route("/api/config", get(admin::config))
        .route("/api/admin/cleanup", post(admin::cleanup))
        .route("/api/auth/secret", get(admin::secret))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

// ============================================================================
// Error Mapping
// ============================================================================

/// Maps a gateway error to its HTTP response.
#[must_use]
pub fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::PendingLimit { .. } | Error::NoExtensions | Error::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::InvalidArgument { .. } | Error::UnknownAction { .. } | Error::Protocol { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::RequestNotFound { .. } => StatusCode::NOT_FOUND,
        Error::SessionExpired { .. } | Error::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
        Error::OriginRejected { .. } | Error::AddressLocked { .. } => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = json!({
        "status": "error",
        "message": error.to_string(),
    });
    if let Some(retry_after) = error.retry_after() {
        body["retryAfter"] = json!(retry_after);
    }

    (status, Json(body)).into_response()
}

// ============================================================================
// Tests
// ============================================================================
