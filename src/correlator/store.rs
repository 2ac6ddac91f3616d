//! Callback store: pending requests and retained results.
//!
//! Keyed store `requestId → entry` shared by the correlator, the sweeps,
//! and the HTTP surface. Terminal transitions are funneled through
//! [`CallbackStore::resolve`], which enforces the exactly-one-terminal
//! invariant under one lock, emits the `callback_result` bus event, and
//! schedules HTTP callback delivery when the caller registered a URL.
//!
//! Two background sweeps run against the store:
//!
//! - timeout sweep: pending entries past their TTL get the synthetic
//!   timeout payload
//! - retention sweep: terminal entries older than the retention period
//!   are deleted

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{BusEvent, EventBus};
use crate::identifiers::RequestId;
use crate::protocol::Action;

// ============================================================================
// CallbackKind
// ============================================================================

/// How the caller expects its terminal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackKind {
    /// Kept for polling (`_internal` sentinel or absent callback URL).
    Internal,
    /// POSTed to the given URL on the terminal transition.
    HttpUrl(String),
    /// Pushed over the automation WebSocket that submitted the command.
    WebSocketInternal,
}

// ============================================================================
// RequestStatus
// ============================================================================

/// Lifecycle status of a stored request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Registered, awaiting dispatch or reply.
    Pending,
    /// Streaming intermediate data (HTML chunks).
    Processing,
    /// Completed successfully.
    Completed,
    /// Timed out waiting for the extension.
    Timeout,
    /// Failed with an extension or dispatch error.
    Error,
}

impl RequestStatus {
    /// Returns `true` for terminal statuses.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Timeout | Self::Error)
    }
}

// ============================================================================
// CallbackEntry
// ============================================================================

/// One stored request.
#[derive(Debug, Clone)]
pub struct CallbackEntry {
    /// The request this entry tracks.
    pub request_id: RequestId,

    /// Result delivery mode.
    pub kind: CallbackKind,

    /// Operation the request performs.
    pub action: Action,

    /// Registration instant.
    pub created: Instant,

    /// How long the entry may stay pending before the timeout sweep
    /// claims it.
    pub ttl: Duration,

    /// Current lifecycle status.
    pub status: RequestStatus,

    /// Terminal payload, set exactly once.
    pub terminal: Option<Value>,

    /// Whether the typed WS push already delivered the result; suppresses
    /// the generic broadcast path.
    pub ws_pushed: bool,

    /// Instant of the terminal transition, for retention.
    pub terminal_at: Option<Instant>,
}

// ============================================================================
// CallbackStore
// ============================================================================

/// The keyed store plus its delivery side effects.
#[derive(Debug)]
pub struct CallbackStore {
    inner: Mutex<FxHashMap<RequestId, CallbackEntry>>,
    bus: EventBus,
    http: reqwest::Client,
}

impl CallbackStore {
    /// Creates a store publishing terminal events on `bus`.
    ///
    /// `delivery_timeout` bounds each HTTP callback POST.
    #[must_use]
    pub fn new(bus: EventBus, delivery_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(delivery_timeout)
            .build()
            .unwrap_or_default();

        Self {
            inner: Mutex::new(FxHashMap::default()),
            bus,
            http,
        }
    }

    /// Registers a pending entry.
    ///
    /// A retained terminal entry under the same ID is overwritten; a live
    /// entry is a registration conflict.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the request ID is already pending.
    pub fn register(
        &self,
        request_id: RequestId,
        action: Action,
        kind: CallbackKind,
        ttl: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.get(&request_id) {
            if !existing.status.is_terminal() {
                return Err(Error::protocol(format!(
                    "requestId {request_id} already pending"
                )));
            }
        }

        inner.insert(
            request_id.clone(),
            CallbackEntry {
                request_id,
                kind,
                action,
                created: Instant::now(),
                ttl,
                status: RequestStatus::Pending,
                terminal: None,
                ws_pushed: false,
                terminal_at: None,
            },
        );
        Ok(())
    }

    /// Marks a pending entry as processing (intermediate data observed).
    pub fn mark_processing(&self, request_id: &RequestId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(request_id) {
            if entry.status == RequestStatus::Pending {
                entry.status = RequestStatus::Processing;
            }
        }
    }

    /// Applies the terminal transition for `request_id`.
    ///
    /// Stores the payload, emits `callback_result`, and schedules HTTP
    /// callback delivery. Exactly one terminal transition succeeds per
    /// request; later attempts fail and the caller drops the late result.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestNotFound`] when no entry exists
    /// - [`Error::Protocol`] when the entry is already terminal
    pub fn resolve(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        payload: Value,
        ws_pushed: bool,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());

        let callback_url = {
            let mut inner = self.inner.lock();
            let entry = inner
                .get_mut(request_id)
                .ok_or_else(|| Error::request_not_found(request_id.clone()))?;

            if entry.status.is_terminal() {
                return Err(Error::protocol(format!(
                    "requestId {request_id} already terminal"
                )));
            }

            entry.status = status;
            entry.terminal = Some(payload.clone());
            entry.ws_pushed = ws_pushed;
            entry.terminal_at = Some(Instant::now());

            match &entry.kind {
                CallbackKind::HttpUrl(url) => Some(url.clone()),
                _ => None,
            }
        };

        self.bus
            .publish(BusEvent::callback_result(request_id.clone(), payload.clone()));

        if let Some(url) = callback_url {
            self.deliver_http(url, payload);
        }

        Ok(())
    }

    /// POSTs a terminal payload to a registered callback URL.
    ///
    /// One attempt; failure is logged and the stored result stays
    /// pollable.
    fn deliver_http(&self, url: String, payload: Value) {
        let client = self.http.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%url, "Callback delivered");
                }
                Ok(response) => {
                    warn!(%url, status = %response.status(), "Callback delivery rejected");
                }
                Err(e) => {
                    warn!(%url, error = %e, "Callback delivery failed");
                }
            }
        });
    }
}

// ============================================================================
// CallbackStore - Queries
// ============================================================================

impl CallbackStore {
    /// Returns a snapshot of the entry for `request_id`.
    #[must_use]
    pub fn get(&self, request_id: &RequestId) -> Option<CallbackEntry> {
        self.inner.lock().get(request_id).cloned()
    }

    /// Returns the terminal payload for `request_id`, if terminal.
    #[must_use]
    pub fn terminal_payload(&self, request_id: &RequestId) -> Option<Value> {
        self.inner
            .lock()
            .get(request_id)
            .and_then(|entry| entry.terminal.clone())
    }

    /// Number of non-terminal entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|entry| !entry.status.is_terminal())
            .count()
    }

    /// Total entries, terminal included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Pending counts per action, for the resource monitor.
    #[must_use]
    pub fn pending_breakdown(&self) -> FxHashMap<Action, usize> {
        let inner = self.inner.lock();
        let mut breakdown = FxHashMap::default();
        for entry in inner.values() {
            if !entry.status.is_terminal() {
                *breakdown.entry(entry.action).or_insert(0) += 1;
            }
        }
        breakdown
    }
}

// ============================================================================
// CallbackStore - Sweeps
// ============================================================================

impl CallbackStore {
    /// Builds the synthetic timeout payload.
    #[must_use]
    pub fn timeout_payload(request_id: &RequestId, action: Action, ttl: Duration) -> Value {
        json!({
            "status": "error",
            "type": "timeout",
            "requestId": request_id,
            "message": format!("Request timed out after {}ms", ttl.as_millis()),
            "operationType": action.as_str(),
        })
    }

    /// Timeout sweep: transitions pending entries past their TTL.
    ///
    /// Returns the request IDs claimed by this sweep so the correlator
    /// can release its dispatch state (timers, dedup claims, stream
    /// buffers) for them.
    pub fn sweep_timeouts(&self) -> Vec<(RequestId, Action)> {
        let now = Instant::now();
        let expired: Vec<(RequestId, Action, Duration)> = {
            let inner = self.inner.lock();
            inner
                .values()
                .filter(|entry| {
                    !entry.status.is_terminal()
                        && now.duration_since(entry.created) > entry.ttl
                })
                .map(|entry| (entry.request_id.clone(), entry.action, entry.ttl))
                .collect()
        };

        let mut claimed = Vec::with_capacity(expired.len());
        for (request_id, action, ttl) in expired {
            let payload = Self::timeout_payload(&request_id, action, ttl);
            match self.resolve(&request_id, RequestStatus::Timeout, payload, false) {
                Ok(()) => {
                    debug!(%request_id, "Request timed out by sweep");
                    claimed.push((request_id, action));
                }
                // Lost the race against the per-request timer; fine.
                Err(_) => {}
            }
        }
        claimed
    }

    /// Retention sweep: deletes terminal entries older than `retention`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_retention(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, entry| {
            entry
                .terminal_at
                .is_none_or(|at| now.duration_since(at) <= retention)
        });
        let removed = before - inner.len();
        if removed > 0 {
            debug!(removed, "Retention sweep removed terminal entries");
        }
        removed
    }

    /// Non-terminal entries older than `age`, for the emergency sweep.
    #[must_use]
    pub fn pending_older_than(&self, age: Duration) -> Vec<(RequestId, Action, Duration)> {
        let now = Instant::now();
        self.inner
            .lock()
            .values()
            .filter(|entry| {
                !entry.status.is_terminal() && now.duration_since(entry.created) > age
            })
            .map(|entry| (entry.request_id.clone(), entry.action, entry.ttl))
            .collect()
    }

    /// Clears the store on shutdown.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CallbackStore {
        CallbackStore::new(EventBus::new(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let store = store();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::OpenUrl,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");
        assert_eq!(store.pending_count(), 1);

        store
            .resolve(
                &request_id,
                RequestStatus::Completed,
                json!({"status": "success", "tabId": 7}),
                false,
            )
            .expect("resolve");

        let entry = store.get(&request_id).expect("entry");
        assert_eq!(entry.status, RequestStatus::Completed);
        assert_eq!(entry.terminal.as_ref().expect("payload")["tabId"], 7);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let store = store();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::OpenUrl,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");

        let err = store
            .register(
                request_id,
                Action::OpenUrl,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_terminal_entry_can_be_reregistered() {
        let store = store();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::OpenUrl,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");
        store
            .resolve(&request_id, RequestStatus::Error, json!({}), false)
            .expect("resolve");

        // Retained terminal entries do not block a fresh request.
        store
            .register(
                request_id,
                Action::OpenUrl,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("re-register");
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_transition() {
        let store = store();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::ExecuteScript,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");

        store
            .resolve(&request_id, RequestStatus::Timeout, json!({"t": 1}), false)
            .expect("first terminal");

        // A late extension reply loses the race and is dropped.
        let err = store
            .resolve(&request_id, RequestStatus::Completed, json!({"t": 2}), false)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        let entry = store.get(&request_id).expect("entry");
        assert_eq!(entry.status, RequestStatus::Timeout);
        assert_eq!(entry.terminal.as_ref().expect("payload")["t"], 1);
    }

    #[tokio::test]
    async fn test_resolve_publishes_bus_event() {
        let bus = EventBus::new();
        let store = CallbackStore::new(bus.clone(), Duration::from_secs(10));
        let mut rx = bus.subscribe();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::GetHtml,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");
        store
            .resolve(&request_id, RequestStatus::Completed, json!({"html": "<p/>"}), true)
            .expect("resolve");

        let event = rx.recv().await.expect("event");
        assert!(event.is_callback_result());
        assert_eq!(event.request_id, Some(request_id));
        assert_eq!(event.data["html"], "<p/>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sweep() {
        let store = store();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::ExecuteScript,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");

        tokio::time::advance(Duration::from_secs(61)).await;
        let claimed = store.sweep_timeouts();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].0, request_id);

        let entry = store.get(&request_id).expect("entry");
        assert_eq!(entry.status, RequestStatus::Timeout);
        let payload = entry.terminal.expect("payload");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["type"], "timeout");
        assert_eq!(payload["message"], "Request timed out after 60000ms");
        assert_eq!(payload["operationType"], "execute_script");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_sweep() {
        let store = store();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::OpenUrl,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");
        store
            .resolve(&request_id, RequestStatus::Completed, json!({}), false)
            .expect("resolve");

        // Inside retention the entry stays pollable.
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(store.sweep_retention(Duration::from_secs(300)), 0);
        assert!(store.get(&request_id).is_some());

        tokio::time::advance(Duration::from_secs(201)).await;
        assert_eq!(store.sweep_retention(Duration::from_secs(300)), 1);
        assert!(store.get(&request_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_never_touches_pending() {
        let store = store();
        let request_id = RequestId::new("r1");

        store
            .register(
                request_id.clone(),
                Action::OpenUrl,
                CallbackKind::Internal,
                Duration::from_secs(600),
            )
            .expect("register");

        tokio::time::advance(Duration::from_secs(500)).await;
        assert_eq!(store.sweep_retention(Duration::from_secs(300)), 0);
        assert!(store.get(&request_id).is_some());
    }

    #[tokio::test]
    async fn test_pending_breakdown() {
        let store = store();
        for (id, action) in [
            ("r1", Action::OpenUrl),
            ("r2", Action::OpenUrl),
            ("r3", Action::GetHtml),
        ] {
            store
                .register(
                    RequestId::new(id),
                    action,
                    CallbackKind::Internal,
                    Duration::from_secs(60),
                )
                .expect("register");
        }

        let breakdown = store.pending_breakdown();
        assert_eq!(breakdown.get(&Action::OpenUrl), Some(&2));
        assert_eq!(breakdown.get(&Action::GetHtml), Some(&1));
    }
}
