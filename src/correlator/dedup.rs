//! Request deduplication.
//!
//! Identical commands issued within the dedup window fold onto the
//! in-flight request instead of reaching the extension twice. Keys are
//! the deterministic projections built by
//! [`Command::dedup_key`](crate::protocol::Command::dedup_key); values
//! are the live request they map to.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::identifiers::RequestId;

// ============================================================================
// DedupEntry
// ============================================================================

#[derive(Debug, Clone)]
struct DedupEntry {
    request_id: RequestId,
    expires: Instant,
}

// ============================================================================
// DedupTable
// ============================================================================

/// Dedup key → live request, bounded by the dedup window.
#[derive(Debug)]
pub struct DedupTable {
    window: Duration,
    inner: Mutex<FxHashMap<String, DedupEntry>>,
}

impl DedupTable {
    /// Creates a table with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(FxHashMap::default()),
        }
    }

    /// Claims `key` for `request_id`.
    ///
    /// Returns the existing live request when the key is already claimed
    /// inside the window (the caller folds onto it and skips dispatch);
    /// otherwise records the claim and returns `None`.
    #[must_use]
    pub fn claim(&self, key: &str, request_id: &RequestId) -> Option<RequestId> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.get(key) {
            if entry.expires > now {
                debug!(key, existing = %entry.request_id, "Deduplicated onto in-flight request");
                return Some(entry.request_id.clone());
            }
        }

        inner.insert(
            key.to_string(),
            DedupEntry {
                request_id: request_id.clone(),
                expires: now + self.window,
            },
        );
        None
    }

    /// Releases `key` if it still maps to `request_id`.
    ///
    /// Called on terminal transitions so the next identical command
    /// dispatches fresh. A key re-claimed by a newer request is left
    /// alone.
    pub fn release(&self, key: &str, request_id: &RequestId) {
        let mut inner = self.inner.lock();
        if inner
            .get(key)
            .is_some_and(|entry| entry.request_id == *request_id)
        {
            inner.remove(key);
        }
    }

    /// Sweeps entries past twice the window (terminal transitions release
    /// eagerly; this bounds leaks from crashed requests).
    pub fn purge_expired(&self) {
        let cutoff = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, entry| entry.expires + self.window > cutoff);
        let purged = before - inner.len();
        if purged > 0 {
            debug!(purged, "Stale dedup entries purged");
        }
    }

    /// Number of live claims.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Clears the table on shutdown.
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

    #[tokio::test]
    async fn test_first_claim_wins() {
        let table = DedupTable::new(Duration::from_secs(5));
        let r1 = RequestId::new("r1");
        let r2 = RequestId::new("r2");

        assert_eq!(table.claim("open_url:https://example.org:null", &r1), None);
        assert_eq!(
            table.claim("open_url:https://example.org:null", &r2),
            Some(r1)
        );
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let table = DedupTable::new(Duration::from_secs(5));
        let r1 = RequestId::new("r1");
        let r2 = RequestId::new("r2");

        assert_eq!(table.claim("get_html:3", &r1), None);
        assert_eq!(table.claim("get_html:4", &r2), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_after_window_dispatches_fresh() {
        let table = DedupTable::new(Duration::from_secs(5));
        let r1 = RequestId::new("r1");
        let r2 = RequestId::new("r2");

        assert_eq!(table.claim("close_tab:7", &r1), None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(table.claim("close_tab:7", &r2), None);
    }

    #[tokio::test]
    async fn test_release_on_terminal() {
        let table = DedupTable::new(Duration::from_secs(60));
        let r1 = RequestId::new("r1");
        let r2 = RequestId::new("r2");

        assert_eq!(table.claim("get_cookies:7", &r1), None);
        table.release("get_cookies:7", &r1);

        // Terminal release makes room inside the window.
        assert_eq!(table.claim("get_cookies:7", &r2), None);
    }

    #[tokio::test]
    async fn test_release_ignores_stale_owner() {
        let table = DedupTable::new(Duration::from_secs(60));
        let r1 = RequestId::new("r1");
        let r2 = RequestId::new("r2");

        assert_eq!(table.claim("get_html:3", &r1), None);
        table.release("get_html:3", &r1);
        assert_eq!(table.claim("get_html:3", &r2), None);

        // A late release from the first request must not evict the second.
        table.release("get_html:3", &r1);
        assert_eq!(
            table.claim("get_html:3", &RequestId::new("r3")),
            Some(r2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_bounds_table() {
        let table = DedupTable::new(Duration::from_secs(5));
        let _ = table.claim("a", &RequestId::new("r1"));
        let _ = table.claim("b", &RequestId::new("r2"));

        tokio::time::advance(Duration::from_secs(11)).await;
        table.purge_expired();
        assert_eq!(table.count(), 0);
    }
}
