//! Resource monitoring and admission control.
//!
//! A periodic health check computes pending-request pressure and process
//! memory. Crossing the warning threshold degrades the health status;
//! reaching capacity flips it to critical and triggers an emergency
//! sweep. Admission control is evaluated before any pending entry is
//! registered, so rejected calls never displace admitted ones.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::correlator::CallbackStore;
use crate::error::{Error, Result};

// ============================================================================
// HealthStatus
// ============================================================================

/// Overall gateway health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Pending pressure below the warning threshold.
    Healthy,
    /// Pending pressure at or above the warning threshold.
    Warning,
    /// Pending pressure at or above capacity.
    Critical,
}

// ============================================================================
// HealthSnapshot
// ============================================================================

/// One health-check observation.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Status derived from pending pressure.
    pub status: HealthStatus,

    /// Non-terminal requests in the callback store.
    pub pending: usize,

    /// Configured pending ceiling.
    #[serde(rename = "pendingLimit")]
    pub pending_limit: usize,

    /// `pending / pendingLimit`.
    pub usage: f64,

    /// Pending counts per operation.
    #[serde(rename = "pendingByOperation")]
    pub breakdown: Vec<(String, usize)>,

    /// Resident set size in bytes, when the platform exposes it.
    #[serde(rename = "rssBytes", skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
}

// ============================================================================
// ResourceMonitor
// ============================================================================

/// Computes health snapshots and gates admissions.
#[derive(Debug)]
pub struct ResourceMonitor {
    max_pending: usize,
    warning_threshold: f64,
    store: Arc<CallbackStore>,
    last: Mutex<Option<HealthSnapshot>>,
}

impl ResourceMonitor {
    /// Creates a monitor over the callback store.
    #[must_use]
    pub fn new(max_pending: usize, warning_threshold: f64, store: Arc<CallbackStore>) -> Self {
        Self {
            max_pending: max_pending.max(1),
            warning_threshold,
            store,
            last: Mutex::new(None),
        }
    }

    /// Admission check run before registering a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PendingLimit`] (advertising a 5 s retry) at
    /// capacity.
    pub fn can_accept_request(&self) -> Result<()> {
        let pending = self.store.pending_count();
        if pending >= self.max_pending {
            warn!(pending, max = self.max_pending, "Admission rejected at capacity");
            return Err(Error::pending_limit(pending, self.max_pending));
        }
        Ok(())
    }

    /// Runs one health check and records the snapshot.
    pub fn check(&self) -> HealthSnapshot {
        let pending = self.store.pending_count();
        let usage = pending as f64 / self.max_pending as f64;

        let status = if usage >= 1.0 {
            HealthStatus::Critical
        } else if usage >= self.warning_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let mut breakdown: Vec<(String, usize)> = self
            .store
            .pending_breakdown()
            .into_iter()
            .map(|(action, count)| (action.as_str().to_string(), count))
            .collect();
        breakdown.sort();

        let snapshot = HealthSnapshot {
            status,
            pending,
            pending_limit: self.max_pending,
            usage,
            breakdown,
            rss_bytes: read_rss_bytes(),
        };

        if status != HealthStatus::Healthy {
            warn!(?status, pending, usage, "Gateway under pressure");
        } else {
            debug!(pending, usage, "Health check");
        }

        *self.last.lock() = Some(snapshot.clone());
        snapshot
    }

    /// The most recent snapshot, if a check has run.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.last.lock().clone()
    }
}

// ============================================================================
// RSS Probe
// ============================================================================

/// Reads the resident set size from `/proc/self/status`.
#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes() -> Option<u64> {
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::correlator::CallbackKind;
    use crate::events::EventBus;
    use crate::identifiers::RequestId;
    use crate::protocol::Action;

    fn setup(max_pending: usize) -> (ResourceMonitor, Arc<CallbackStore>) {
        let store = Arc::new(CallbackStore::new(EventBus::new(), Duration::from_secs(10)));
        let monitor = ResourceMonitor::new(max_pending, 0.8, Arc::clone(&store));
        (monitor, store)
    }

    fn fill(store: &CallbackStore, count: usize) {
        for i in 0..count {
            store
                .register(
                    RequestId::new(format!("r{i}")),
                    Action::OpenUrl,
                    CallbackKind::Internal,
                    Duration::from_secs(60),
                )
                .expect("register");
        }
    }

    #[tokio::test]
    async fn test_healthy_below_warning() {
        let (monitor, store) = setup(10);
        fill(&store, 5);

        let snapshot = monitor.check();
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(snapshot.pending, 5);
        assert!(monitor.can_accept_request().is_ok());
    }

    #[tokio::test]
    async fn test_warning_at_threshold() {
        let (monitor, store) = setup(10);
        fill(&store, 8);

        let snapshot = monitor.check();
        assert_eq!(snapshot.status, HealthStatus::Warning);
        // Warning still admits.
        assert!(monitor.can_accept_request().is_ok());
    }

    #[tokio::test]
    async fn test_critical_at_capacity() {
        let (monitor, store) = setup(10);
        fill(&store, 10);

        let snapshot = monitor.check();
        assert_eq!(snapshot.status, HealthStatus::Critical);

        let err = monitor.can_accept_request().unwrap_err();
        assert!(matches!(err, Error::PendingLimit { .. }));
        assert_eq!(err.retry_after(), Some(5));
    }

    #[tokio::test]
    async fn test_breakdown_by_operation() {
        let (monitor, store) = setup(10);
        store
            .register(
                RequestId::new("a"),
                Action::GetHtml,
                CallbackKind::Internal,
                Duration::from_secs(60),
            )
            .expect("register");
        fill(&store, 2);

        let snapshot = monitor.check();
        assert!(
            snapshot
                .breakdown
                .iter()
                .any(|(name, count)| name == "get_html" && *count == 1)
        );
        assert!(
            snapshot
                .breakdown
                .iter()
                .any(|(name, count)| name == "open_url" && *count == 2)
        );
    }

    #[tokio::test]
    async fn test_last_snapshot_retained() {
        let (monitor, _store) = setup(10);
        assert!(monitor.last_snapshot().is_none());

        monitor.check();
        assert!(monitor.last_snapshot().is_some());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_rss_probe() {
        let (monitor, _store) = setup(10);
        let snapshot = monitor.check();
        assert!(snapshot.rss_bytes.is_some_and(|rss| rss > 0));
    }
}
