//! Request/response correlation.
//!
//! Every command has exactly one correlator entry tying together the
//! caller, the chosen extension, the request timer, and the terminal
//! result:
//!
//! ```text
//! NEW → REGISTERED → DISPATCHED → (STREAMING?) → COMPLETED
//!              │          │            │             ↑
//!              │          ├── TIMEOUT ─┘             │
//!              │          └── ERROR ─────────────────┘
//!              └── DEDUPED (no extension call)
//! ```
//!
//! Terminal delivery happens exactly once per request: a live automation
//! WebSocket gets the typed push and the stored entry is flagged
//! `ws_pushed` so the generic broadcast path stays quiet; every other
//! caller reads the callback store through long-poll, SSE, or an HTTP
//! callback POST.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `store` | Callback store, sweeps, HTTP callback delivery |
//! | `dedup` | Dedup key → live request within the window |
//! | `stream` | HTML chunk reassembly |

// ============================================================================
// Submodules
// ============================================================================

/// Callback store and sweeps.
pub mod store;

/// Request deduplication.
pub mod dedup;

/// HTML stream reassembly.
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use dedup::DedupTable;
pub use store::{CallbackEntry, CallbackKind, CallbackStore, RequestStatus};
pub use stream::{StreamBuffer, StreamTable};

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::audit::{AuditKind, AuditRecord, AuditSink};
use crate::error::Result;
use crate::events::{BusEvent, EventBus};
use crate::hub::{ClientHub, ExtensionHub};
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::{Action, Command, notify};

// ============================================================================
// Delivery
// ============================================================================

/// How the caller of a command wants its terminal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Push over the automation WebSocket that submitted the command.
    WebSocket(ConnectionId),
    /// POST to this callback URL.
    HttpUrl(String),
    /// Keep for polling.
    Internal,
}

impl Delivery {
    fn callback_kind(&self) -> CallbackKind {
        match self {
            Self::WebSocket(_) => CallbackKind::WebSocketInternal,
            Self::HttpUrl(url) => CallbackKind::HttpUrl(url.clone()),
            Self::Internal => CallbackKind::Internal,
        }
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Outcome of a successful [`Correlator::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The command was registered and dispatched to one extension.
    Dispatched {
        /// The request to await.
        request_id: RequestId,
    },
    /// An identical command is already in flight; no dispatch happened.
    Deduplicated {
        /// The caller's request ID.
        request_id: RequestId,
        /// The in-flight request the call folded onto.
        existing: RequestId,
    },
}

// ============================================================================
// PendingDispatch
// ============================================================================

/// Correlator-side state for one dispatched command.
#[derive(Debug)]
struct PendingDispatch {
    action: Action,
    dedup_key: Option<String>,
    delivery: Delivery,
    timer: AbortHandle,
    dispatched_at: Instant,
    ttl: Duration,
}

// ============================================================================
// Correlator
// ============================================================================

/// The per-request state machine.
#[derive(Debug)]
pub struct Correlator {
    request_timeout: Duration,
    store: Arc<CallbackStore>,
    dedup: DedupTable,
    streams: StreamTable,
    pending: Mutex<FxHashMap<RequestId, PendingDispatch>>,
    extensions: Arc<ExtensionHub>,
    clients: Arc<ClientHub>,
    bus: EventBus,
    audit: AuditSink,
}

impl Correlator {
    /// Creates a correlator over the given collaborators.
    #[must_use]
    pub fn new(
        request_timeout: Duration,
        dedup_window: Duration,
        store: Arc<CallbackStore>,
        extensions: Arc<ExtensionHub>,
        clients: Arc<ClientHub>,
        bus: EventBus,
        audit: AuditSink,
    ) -> Self {
        Self {
            request_timeout,
            store,
            dedup: DedupTable::new(dedup_window),
            streams: StreamTable::new(),
            pending: Mutex::new(FxHashMap::default()),
            extensions,
            clients,
            bus,
            audit,
        }
    }

    /// The callback store backing this correlator.
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<CallbackStore> {
        &self.store
    }

    /// Number of dispatched, unresolved requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of live dedup claims.
    #[must_use]
    pub fn dedup_count(&self) -> usize {
        self.dedup.count()
    }

    /// Number of in-flight HTML streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.count()
    }
}

// ============================================================================
// Correlator - Submission
// ============================================================================

impl Correlator {
    /// Registers and dispatches a command.
    ///
    /// The caller has already passed admission control and rate
    /// limiting. Dedup is consulted first: an identical in-flight
    /// command short-circuits without touching the extension.
    ///
    /// # Errors
    ///
    /// - [`Error::NoExtensions`] when every extension slot failed; the
    ///   terminal error is stored for pollers before returning
    /// - [`Error::Protocol`] on request-ID collisions
    pub fn submit(
        self: &Arc<Self>,
        command: &Command,
        request_id: Option<RequestId>,
        delivery: Delivery,
    ) -> Result<Submission> {
        let request_id = request_id.unwrap_or_else(RequestId::generate);
        let action = command.action;

        // Dedup before any registration: a folded call must not displace
        // the in-flight request's state.
        let dedup_key = command.dedup_key();
        if let Some(ref key) = dedup_key {
            if let Some(existing) = self.dedup.claim(key, &request_id) {
                return Ok(Submission::Deduplicated {
                    request_id,
                    existing,
                });
            }
        }

        if let Err(e) = self.store.register(
            request_id.clone(),
            action,
            delivery.callback_kind(),
            self.request_timeout,
        ) {
            if let Some(ref key) = dedup_key {
                self.dedup.release(key, &request_id);
            }
            return Err(e);
        }

        // Round-robin dispatch; exhaustion terminates the entry so HTTP
        // pollers still observe the failure.
        if let Err(e) = self
            .extensions
            .send_to_extensions(&command.envelope(&request_id))
        {
            let payload = json!({
                "status": "error",
                "requestId": request_id,
                "operationType": action.as_str(),
                "message": e.to_string(),
            });
            let _ = self
                .store
                .resolve(&request_id, RequestStatus::Error, payload, false);
            if let Some(ref key) = dedup_key {
                self.dedup.release(key, &request_id);
            }
            return Err(e);
        }

        let timer = self.arm_timer(request_id.clone());
        self.pending.lock().insert(
            request_id.clone(),
            PendingDispatch {
                action,
                dedup_key,
                delivery,
                timer,
                dispatched_at: Instant::now(),
                ttl: self.request_timeout,
            },
        );

        Ok(Submission::Dispatched { request_id })
    }

    /// Arms the per-request timer.
    fn arm_timer(self: &Arc<Self>, request_id: RequestId) -> AbortHandle {
        let correlator = Arc::clone(self);
        let ttl = self.request_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            correlator.on_timeout(&request_id);
        });
        handle.abort_handle()
    }
}

// ============================================================================
// Correlator - Extension Replies
// ============================================================================

impl Correlator {
    /// Records an intermediate HTML chunk.
    ///
    /// Chunks for unknown requests are logged and dropped.
    pub fn on_chunk(
        &self,
        request_id: &RequestId,
        chunk_index: usize,
        chunk_data: String,
        total_chunks: Option<usize>,
    ) {
        if !self.pending.lock().contains_key(request_id) {
            warn!(%request_id, chunk_index, "Chunk for unknown request dropped");
            return;
        }

        self.store.mark_processing(request_id);
        self.streams
            .push_chunk(request_id, chunk_index, chunk_data, total_chunks);
    }

    /// Resolves a request with an extension completion.
    ///
    /// Late replies (after timeout or a competing terminal) are logged
    /// and dropped; the connection stays healthy.
    pub fn on_complete(&self, request_id: &RequestId, mut data: Value) {
        let Some(dispatch) = self.take_dispatch(request_id) else {
            warn!(%request_id, "Late or unmatched completion dropped");
            return;
        };

        // Reassemble streamed HTML before building the payload.
        if dispatch.action == Action::GetHtml {
            if let Some(buffer) = self.streams.take(request_id) {
                if buffer.chunk_count() > 0 {
                    let html = buffer.assemble();
                    if let Value::Object(ref mut map) = data {
                        map.insert("html".to_string(), Value::String(html));
                    }
                }
            }
        }

        let payload = json!({
            "status": "success",
            "requestId": request_id,
            "operationType": dispatch.action.as_str(),
            "data": data,
        });

        let ws_pushed = self.push_to_caller(
            &dispatch,
            request_id,
            notify::success(dispatch.action, request_id, data.clone()),
        );

        match self
            .store
            .resolve(request_id, RequestStatus::Completed, payload, ws_pushed)
        {
            Ok(()) => {
                if let Some(event) = completion_event(dispatch.action) {
                    self.bus.publish(BusEvent::named(event, data));
                }
                self.audit_terminal(&dispatch, request_id, "success");
            }
            Err(_) => {
                warn!(%request_id, "Completion lost the terminal race, dropped");
            }
        }
    }

    /// Resolves a request with an extension error.
    pub fn on_error(&self, request_id: &RequestId, message: &str, code: Option<&str>) {
        let Some(dispatch) = self.take_dispatch(request_id) else {
            warn!(%request_id, "Late or unmatched error dropped");
            return;
        };

        let payload = json!({
            "status": "error",
            "requestId": request_id,
            "operationType": dispatch.action.as_str(),
            "message": message,
            "code": code,
        });

        let ws_pushed = self.push_to_caller(
            &dispatch,
            request_id,
            notify::error(dispatch.action, request_id, message),
        );

        match self
            .store
            .resolve(request_id, RequestStatus::Error, payload, ws_pushed)
        {
            Ok(()) => {
                self.bus.publish(BusEvent::named(
                    "error",
                    json!({"requestId": request_id, "message": message}),
                ));
                self.audit_terminal(&dispatch, request_id, "error");
            }
            Err(_) => warn!(%request_id, "Error reply lost the terminal race, dropped"),
        }
    }

    /// Timer path: the extension never replied.
    fn on_timeout(&self, request_id: &RequestId) {
        let Some(dispatch) = self.take_dispatch(request_id) else {
            return;
        };

        let payload = CallbackStore::timeout_payload(request_id, dispatch.action, dispatch.ttl);
        let message = format!("Request timed out after {}ms", dispatch.ttl.as_millis());

        let ws_pushed = self.push_to_caller(
            &dispatch,
            request_id,
            notify::error(dispatch.action, request_id, &message),
        );

        match self
            .store
            .resolve(request_id, RequestStatus::Timeout, payload, ws_pushed)
        {
            Ok(()) => {
                self.bus.publish(BusEvent::named(
                    "request_timeout",
                    json!({
                        "requestId": request_id,
                        "operationType": dispatch.action.as_str(),
                    }),
                ));
                self.audit_terminal(&dispatch, request_id, "timeout");
                debug!(%request_id, "Request timed out");
            }
            Err(_) => debug!(%request_id, "Timeout lost the terminal race"),
        }
    }

    /// Removes the dispatch entry, cancels its timer, and releases its
    /// dedup claim and stream buffer.
    fn take_dispatch(&self, request_id: &RequestId) -> Option<PendingDispatch> {
        let dispatch = self.pending.lock().remove(request_id)?;
        dispatch.timer.abort();
        if let Some(ref key) = dispatch.dedup_key {
            self.dedup.release(key, request_id);
        }
        self.streams.discard(request_id);
        Some(dispatch)
    }

    /// Pushes the typed response to a live automation caller.
    ///
    /// Returns `true` only when the push succeeded, which suppresses the
    /// generic broadcast for this request.
    fn push_to_caller(
        &self,
        dispatch: &PendingDispatch,
        request_id: &RequestId,
        message: Value,
    ) -> bool {
        match dispatch.delivery {
            Delivery::WebSocket(connection_id) => {
                match self.clients.send_to(connection_id, &message) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(%request_id, error = %e, "WS push failed, result stays pollable");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn audit_terminal(&self, dispatch: &PendingDispatch, request_id: &RequestId, status: &str) {
        self.audit.record(
            AuditRecord::new(AuditKind::RequestTerminal)
                .action(dispatch.action.as_str())
                .status(status)
                .duration_ms(dispatch.dispatched_at.elapsed().as_millis() as u64)
                .request(request_id.clone()),
        );
    }
}

// ============================================================================
// Correlator - Sweeps & Shutdown
// ============================================================================

impl Correlator {
    /// Runs the store's timeout sweep and releases dispatch state for
    /// every entry the sweep claimed.
    ///
    /// The per-request timer is the primary timeout path; the sweep is
    /// the backstop for timers lost under load.
    pub fn sweep_timeouts(&self) {
        for (request_id, action) in self.store.sweep_timeouts() {
            if self.take_dispatch(&request_id).is_some() {
                self.bus.publish(BusEvent::named(
                    "request_timeout",
                    json!({
                        "requestId": request_id,
                        "operationType": action.as_str(),
                    }),
                ));
            }
        }
    }

    /// Retention sweep passthrough.
    pub fn sweep_retention(&self, retention: Duration) {
        let _ = self.store.sweep_retention(retention);
    }

    /// Prunes stale dedup claims.
    pub fn sweep_dedup(&self) {
        self.dedup.purge_expired();
    }

    /// Emergency sweep: force-timeout entries older than `age`.
    pub fn force_timeout_older_than(&self, age: Duration) -> usize {
        let stale = self.store.pending_older_than(age);
        let count = stale.len();
        for (request_id, action, ttl) in stale {
            let payload = CallbackStore::timeout_payload(&request_id, action, ttl);
            if self
                .store
                .resolve(&request_id, RequestStatus::Timeout, payload, false)
                .is_ok()
            {
                let _ = self.take_dispatch(&request_id);
                warn!(%request_id, "Force-timed-out by emergency sweep");
            }
        }
        count
    }

    /// Clears all correlation state on shutdown.
    ///
    /// Every armed timer is cancelled; no timer survives shutdown.
    pub fn shutdown(&self) {
        let pending: Vec<(RequestId, PendingDispatch)> = {
            let mut guard = self.pending.lock();
            guard.drain().collect()
        };
        for (_, dispatch) in &pending {
            dispatch.timer.abort();
        }
        self.dedup.clear();
        self.streams.clear();
        self.store.clear();
        debug!(cancelled = pending.len(), "Correlator shut down");
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Event name broadcast to subscribed clients when an action completes.
fn completion_event(action: Action) -> Option<&'static str> {
    match action {
        Action::OpenUrl => Some("tab_opened"),
        Action::CloseTab => Some("tab_closed"),
        Action::GetHtml => Some("tab_html_received"),
        Action::ExecuteScript => Some("script_executed"),
        Action::InjectCss => Some("css_injected"),
        Action::GetCookies => Some("cookies_received"),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
