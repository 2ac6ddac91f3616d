//! Process-wide event bus.
//!
//! Terminal results and browser notifications fan out to long-poll waiters,
//! SSE streams, and the client hub through a single broadcast channel.
//! Receivers that lag are dropped by the channel rather than blocking
//! publishers; every consumer tolerates missed events by consulting the
//! callback store directly.
//!
//! # Event Flow
//!
//! ```text
//! Correlator ──┐
//! Sweeps ──────┼──▶ EventBus ──▶ long-poll waiters
//! Extension ───┘              ──▶ SSE streams
//!    dispatch                 ──▶ ClientHub fan-out
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;
use tokio::sync::broadcast;

use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Bus capacity; slow receivers past this lag are disconnected.
const BUS_CAPACITY: usize = 256;

/// Event name used for terminal request results.
pub const CALLBACK_RESULT: &str = "callback_result";

// ============================================================================
// BusEvent
// ============================================================================

/// A single event published on the process-wide bus.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Event name (`callback_result`, `tab_opened`, ...).
    pub event: String,

    /// Request ID for events tied to one request.
    pub request_id: Option<RequestId>,

    /// Event payload.
    pub data: Value,
}

impl BusEvent {
    /// Creates a named event without request affinity.
    #[inline]
    #[must_use]
    pub fn named(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            request_id: None,
            data,
        }
    }

    /// Creates a `callback_result` event for a terminal request.
    #[inline]
    #[must_use]
    pub fn callback_result(request_id: RequestId, data: Value) -> Self {
        Self {
            event: CALLBACK_RESULT.to_string(),
            request_id: Some(request_id),
            data,
        }
    }

    /// Returns `true` if this is a terminal-result event.
    #[inline]
    #[must_use]
    pub fn is_callback_result(&self) -> bool {
        self.event == CALLBACK_RESULT
    }
}

// ============================================================================
// EventBus
// ============================================================================

/// Broadcast channel wrapper shared by all gateway components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Creates a new bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to all subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(BusEvent::named("tab_opened", json!({"tabId": 7})));

        let event = rx.recv().await.expect("receive");
        assert_eq!(event.event, "tab_opened");
        assert_eq!(event.data["tabId"], 7);
        assert!(event.request_id.is_none());
    }

    #[tokio::test]
    async fn test_callback_result_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let request_id = RequestId::new("r1");
        bus.publish(BusEvent::callback_result(
            request_id.clone(),
            json!({"status": "success"}),
        ));

        let event = rx.recv().await.expect("receive");
        assert!(event.is_callback_result());
        assert_eq!(event.request_id, Some(request_id));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        // Should not panic or error.
        bus.publish(BusEvent::named("tabs_update", json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(BusEvent::named("custom_event", json!({"n": 1})));

        assert_eq!(rx1.recv().await.expect("rx1").event, "custom_event");
        assert_eq!(rx2.recv().await.expect("rx2").event, "custom_event");
    }
}
