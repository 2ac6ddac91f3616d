//! Server-sent events.
//!
//! `GET /api/events[?requestId=…]` streams every bus event, including
//! `callback_result`, as named SSE events. A comment heartbeat keeps
//! idle streams alive; dropping the response cleans up the bus
//! subscription.

// ============================================================================
// Imports
// ============================================================================

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use futures_util::stream;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::events::BusEvent;
use crate::gateway::Gateway;
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Comment heartbeat cadence for idle streams.
const HEARTBEAT: Duration = Duration::from_secs(30);

// ============================================================================
// EventQuery
// ============================================================================

/// Query parameters for the event stream.
#[derive(Debug, Deserialize)]
pub struct EventQuery {
    /// Restrict the stream to events for one request.
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

// ============================================================================
// Handler
// ============================================================================

/// `GET /api/events`
pub async fn events(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = gateway.bus().subscribe();
    let filter = query.request_id.map(RequestId::new);

    let stream = stream::unfold((rx, filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !matches(&event, filter.as_ref()) {
                        continue;
                    }
                    let sse_event = Event::default()
                        .event(event.event.clone())
                        .data(event.data.to_string());
                    return Some((Ok(sse_event), (rx, filter)));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT))
}

/// Applies the optional request filter.
fn matches(event: &BusEvent, filter: Option<&RequestId>) -> bool {
    match filter {
        Some(request_id) => event.request_id.as_ref() == Some(request_id),
        None => true,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_filter_matches_request() {
        let event = BusEvent::callback_result(RequestId::new("r1"), json!({}));
        assert!(matches(&event, None));
        assert!(matches(&event, Some(&RequestId::new("r1"))));
        assert!(!matches(&event, Some(&RequestId::new("r2"))));
    }

    #[test]
    fn test_filter_drops_unrelated_events() {
        let event = BusEvent::named("tabs_update", json!({}));
        assert!(matches(&event, None));
        assert!(!matches(&event, Some(&RequestId::new("r1"))));
    }
}
