//! HTML stream reassembly.
//!
//! `get_html` replies arrive as a sequence of `tab_html_chunk` messages
//! followed by `tab_html_complete`. Chunks may arrive out of order; the
//! buffer keys them by index and assembles in index order on completion.
//! Buffers are bounded by the request timer: the owning request times
//! out, the buffer goes with it.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::identifiers::RequestId;

// ============================================================================
// StreamBuffer
// ============================================================================

/// Accumulates chunks for one in-flight `get_html` request.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    /// Received chunks keyed by index.
    chunks: BTreeMap<usize, String>,

    /// Expected chunk count, once the extension announces it.
    expected: Option<usize>,
}

impl StreamBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a chunk. A duplicate index overwrites the previous chunk.
    pub fn insert(&mut self, index: usize, data: String, total: Option<usize>) {
        if let Some(total) = total {
            self.expected = Some(total);
        }
        self.chunks.insert(index, data);
    }

    /// Number of distinct chunks received.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` once every announced chunk arrived.
    ///
    /// Without an announced total the buffer never self-completes; the
    /// `tab_html_complete` message decides.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.expected.is_some_and(|total| self.chunks.len() >= total)
    }

    /// Concatenates all chunks in index order.
    #[must_use]
    pub fn assemble(self) -> String {
        let mut html = String::with_capacity(self.chunks.values().map(String::len).sum());
        for chunk in self.chunks.into_values() {
            html.push_str(&chunk);
        }
        html
    }
}

// ============================================================================
// StreamTable
// ============================================================================

/// Per-request stream buffers.
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: Mutex<FxHashMap<RequestId, StreamBuffer>>,
}

impl StreamTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a chunk for `request_id`, creating the buffer on first use.
    pub fn push_chunk(
        &self,
        request_id: &RequestId,
        index: usize,
        data: String,
        total: Option<usize>,
    ) {
        let mut inner = self.inner.lock();
        inner
            .entry(request_id.clone())
            .or_default()
            .insert(index, data, total);
    }

    /// Takes the buffer for `request_id` at stream completion.
    #[must_use]
    pub fn take(&self, request_id: &RequestId) -> Option<StreamBuffer> {
        self.inner.lock().remove(request_id)
    }

    /// Drops the buffer for a request that reached a terminal state
    /// without completing its stream.
    pub fn discard(&self, request_id: &RequestId) {
        if self.inner.lock().remove(request_id).is_some() {
            debug!(%request_id, "Discarded incomplete stream buffer");
        }
    }

    /// Number of in-flight streams.
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
