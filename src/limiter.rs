//! Sliding-window rate limiting and auth-failure lockout.
//!
//! Four independent counters, each a time-ordered queue pruned on read:
//!
//! | Counter | Key | Default limit |
//! |---------|-----|---------------|
//! | Global | caller | 300 / 60 s |
//! | Sensitive | caller | 30 / 60 s |
//! | Auth failures | remote address | 5 / 60 s, then lockout |
//! | Callback polls | caller + request | 60 / 60 s, 60 total per request |
//!
//! Checks are side-effect-free; the caller records separately on success
//! so that rejected calls never displace admitted ones. Admission control
//! consults the limiter before any pending entry is registered.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, RequestId};

// ============================================================================
// SlidingWindow
// ============================================================================

/// Time-ordered queue of event instants, pruned on read.
#[derive(Debug, Default)]
struct SlidingWindow {
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Drops events older than `now − window`.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of events still inside the window.
    fn len(&mut self, now: Instant, window: Duration) -> usize {
        self.prune(now, window);
        self.events.len()
    }

    /// Records an event at `now`.
    fn push(&mut self, now: Instant) {
        self.events.push_back(now);
    }

    /// Seconds until the oldest event leaves the window (min 1).
    fn retry_after(&self, now: Instant, window: Duration) -> u64 {
        self.events
            .front()
            .map(|&oldest| {
                let remaining = (oldest + window).saturating_duration_since(now);
                remaining.as_secs().max(1)
            })
            .unwrap_or(1)
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ============================================================================
// Inner State
// ============================================================================

#[derive(Debug, Default)]
struct Inner {
    /// Per-caller global window.
    global: FxHashMap<ClientId, SlidingWindow>,
    /// Per-caller sensitive window.
    sensitive: FxHashMap<ClientId, SlidingWindow>,
    /// Per-address auth-failure window.
    failures: FxHashMap<IpAddr, SlidingWindow>,
    /// Per-address lock expiry.
    locks: FxHashMap<IpAddr, Instant>,
    /// Per-caller poll window.
    polls: FxHashMap<ClientId, SlidingWindow>,
    /// Per-request total poll count.
    poll_counts: FxHashMap<RequestId, usize>,
}

// ============================================================================
// RateLimiter
// ============================================================================

/// Sliding-window rate limiter with auth-failure lockout.
///
/// All counters live behind one lock; no I/O happens under it.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    /// Creates a limiter with the given window configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the window configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// ============================================================================
// RateLimiter - Command Windows
// ============================================================================

impl RateLimiter {
    /// Checks whether `caller` may issue another command.
    ///
    /// Side-effect-free apart from pruning. Sensitive actions are checked
    /// against both the global and the sensitive window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] with the window scope and retry delay.
    pub fn check_request(&self, caller: &ClientId, sensitive: bool) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let global = inner.global.entry(caller.clone()).or_default();
        if global.len(now, self.config.window) >= self.config.global_limit {
            let retry = global.retry_after(now, self.config.window);
            return Err(Error::rate_limited("global", retry));
        }

        if sensitive {
            let win = inner.sensitive.entry(caller.clone()).or_default();
            if win.len(now, self.config.window) >= self.config.sensitive_limit {
                let retry = win.retry_after(now, self.config.window);
                return Err(Error::rate_limited("sensitive", retry));
            }
        }

        Ok(())
    }

    /// Records an admitted command for `caller`.
    pub fn record_request(&self, caller: &ClientId, sensitive: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.global.entry(caller.clone()).or_default().push(now);
        if sensitive {
            inner.sensitive.entry(caller.clone()).or_default().push(now);
        }
    }
}

// ============================================================================
// RateLimiter - Auth Failures & Lockout
// ============================================================================

impl RateLimiter {
    /// Returns the remaining lock duration for `addr`, if locked.
    #[must_use]
    pub fn locked_for(&self, addr: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.locks.get(&addr) {
            Some(&until) if until > now => Some(until - now),
            Some(_) => {
                inner.locks.remove(&addr);
                None
            }
            None => None,
        }
    }

    /// Records an auth failure from `addr`.
    ///
    /// At the failure threshold the address is locked for the configured
    /// duration and its failure window is cleared. Returns the lock
    /// duration when a lock was engaged by this call.
    pub fn record_auth_failure(&self, addr: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let window = inner.failures.entry(addr).or_default();
        window.push(now);

        if window.len(now, self.config.failure_window) >= self.config.max_failed_attempts {
            inner.failures.remove(&addr);
            inner
                .locks
                .insert(addr, now + self.config.lockout_duration);
            warn!(%addr, lockout_secs = self.config.lockout_duration.as_secs(), "Address locked after repeated auth failures");
            return Some(self.config.lockout_duration);
        }

        None
    }
}

// ============================================================================
// RateLimiter - Callback Polls
// ============================================================================

impl RateLimiter {
    /// Checks whether `caller` may poll for `request_id` again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] when either the per-caller window or
    /// the per-request ceiling is exhausted.
    pub fn check_poll(&self, caller: &ClientId, request_id: &RequestId) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let win = inner.polls.entry(caller.clone()).or_default();
        if win.len(now, self.config.poll_window) >= self.config.poll_limit {
            let retry = win.retry_after(now, self.config.poll_window);
            return Err(Error::rate_limited("poll", retry));
        }

        let count = inner.poll_counts.get(request_id).copied().unwrap_or(0);
        if count >= self.config.max_polls_per_request {
            return Err(Error::rate_limited("poll", 1));
        }

        Ok(())
    }

    /// Records an admitted poll.
    pub fn record_poll(&self, caller: &ClientId, request_id: &RequestId) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.polls.entry(caller.clone()).or_default().push(now);
        *inner.poll_counts.entry(request_id.clone()).or_insert(0) += 1;
    }

    /// Clears the per-request poll counter once the result is delivered.
    pub fn clear_poll_count(&self, request_id: &RequestId) {
        self.inner.lock().poll_counts.remove(request_id);
    }
}

// ============================================================================
// RateLimiter - Janitor
// ============================================================================

impl RateLimiter {
    /// Purges empty windows and expired locks.
    ///
    /// Run periodically; counters also self-prune on every read.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let window = self.config.window;
        inner.global.retain(|_, w| {
            w.prune(now, window);
            !w.is_empty()
        });
        inner.sensitive.retain(|_, w| {
            w.prune(now, window);
            !w.is_empty()
        });

        let failure_window = self.config.failure_window;
        inner.failures.retain(|_, w| {
            w.prune(now, failure_window);
            !w.is_empty()
        });

        let poll_window = self.config.poll_window;
        inner.polls.retain(|_, w| {
            w.prune(now, poll_window);
            !w.is_empty()
        });

        let before = inner.locks.len();
        inner.locks.retain(|_, &mut until| until > now);
        let expired = before - inner.locks.len();
        if expired > 0 {
            debug!(expired, "Expired address locks purged");
        }
    }

    /// Number of live counters, for the status endpoint.
    #[must_use]
    pub fn counter_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.global.len() + inner.sensitive.len() + inner.failures.len() + inner.polls.len()
    }

    /// Number of currently locked addresses.
    #[must_use]
    pub fn locked_count(&self) -> usize {
        self.inner.lock().locks.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
