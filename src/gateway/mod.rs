//! The gateway instance.
//!
//! One [`Gateway`] owns every component and every background task. It is
//! the single piece of process-wide state; construction wires the
//! collaborators together explicitly and [`Gateway::shutdown`] tears
//! everything down: sockets closed with 1000, tables cleared, periodic
//! tasks stopped, no timer left scheduled.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Per-connection handle and writer task |
//! | `handshake` | Challenge/response over a fresh socket |
//! | `server` | Accept loop, admission gates, read loops |
//! | `heartbeat` | Ping tick and session surveillance |

// ============================================================================
// Submodules
// ============================================================================

/// Per-connection state and writes.
pub mod connection;

/// Auth handshake over a fresh socket.
pub mod handshake;

/// Accept loop and per-role read loops.
pub mod server;

/// Heartbeat and session surveillance.
pub mod heartbeat;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audit::{AuditKind, AuditRecord, AuditSink};
use crate::auth::AuthManager;
use crate::config::GatewayConfig;
use crate::correlator::{CallbackStore, Correlator};
use crate::error::Result;
use crate::events::EventBus;
use crate::hub::{ClientHub, ExtensionHub};
use crate::limiter::RateLimiter;
use crate::monitor::{HealthStatus, ResourceMonitor};

// ============================================================================
// Constants
// ============================================================================

/// Cadence of the rate-limiter janitor.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// TabSnapshot
// ============================================================================

/// Last tab state pushed by an extension `data` message.
#[derive(Debug, Default)]
struct TabSnapshot {
    tabs: Option<Value>,
    active_tab_id: Option<i64>,
}

// ============================================================================
// Gateway
// ============================================================================

/// The assembled gateway: components, listeners, background tasks.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    auth: AuthManager,
    limiter: RateLimiter,
    audit: AuditSink,
    bus: EventBus,
    extensions: Arc<ExtensionHub>,
    clients: Arc<ClientHub>,
    correlator: Arc<Correlator>,
    monitor: ResourceMonitor,
    snapshot: Mutex<TabSnapshot>,
    cookies: Mutex<Vec<Value>>,
    shutdown: AtomicBool,
    ws_addr: SocketAddr,
    http_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Binds both listeners, wires the components, and spawns every
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) when a bind fails and
    /// [`Error::Secret`](crate::Error::Secret) when secret discovery
    /// fails.
    pub async fn start(config: GatewayConfig) -> Result<Arc<Self>> {
        let ws_listener = TcpListener::bind(config.ws_bind).await?;
        let ws_addr = ws_listener.local_addr()?;
        let http_listener = TcpListener::bind(config.http_bind).await?;
        let http_addr = http_listener.local_addr()?;

        let auth = AuthManager::new(&config)?;
        let limiter = RateLimiter::new(config.rate.clone());
        let audit = AuditSink::logging();
        let bus = EventBus::new();

        let store = Arc::new(CallbackStore::new(
            bus.clone(),
            config.callback_delivery_timeout,
        ));
        let extensions = Arc::new(ExtensionHub::new());
        let clients = Arc::new(ClientHub::new());
        let correlator = Arc::new(Correlator::new(
            config.request_timeout,
            config.dedup_window,
            Arc::clone(&store),
            Arc::clone(&extensions),
            Arc::clone(&clients),
            bus.clone(),
            audit.clone(),
        ));
        let monitor =
            ResourceMonitor::new(config.max_pending_responses, config.warning_threshold, store);

        let gateway = Arc::new(Self {
            config,
            auth,
            limiter,
            audit,
            bus,
            extensions,
            clients,
            correlator,
            monitor,
            snapshot: Mutex::new(TabSnapshot::default()),
            cookies: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            ws_addr,
            http_addr,
            tasks: Mutex::new(Vec::new()),
        });

        gateway.spawn_tasks(ws_listener, http_listener);

        info!(ws = %ws_addr, http = %http_addr, "Gateway started");
        Ok(gateway)
    }

    /// Spawns the accept loop, HTTP server, heartbeat, sweeps, janitor,
    /// monitor, and event fan-out.
    fn spawn_tasks(self: &Arc<Self>, ws_listener: TcpListener, http_listener: TcpListener) {
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(server::accept_loop(
            Arc::clone(self),
            ws_listener,
        )));

        let router = crate::http::router(Arc::clone(self));
        tasks.push(tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(http_listener, service).await {
                tracing::error!(error = %e, "HTTP server terminated");
            }
        }));

        tasks.push(tokio::spawn(heartbeat::run(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::run_sweeps(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::run_janitor(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::run_monitor(Arc::clone(self))));
        tasks.push(tokio::spawn(
            Arc::clone(&self.clients).run_fanout(self.bus.subscribe()),
        ));
    }

    /// Timeout and retention sweeps.
    async fn run_sweeps(gateway: Arc<Self>) {
        let mut timeout_tick = tokio::time::interval(gateway.config.timeout_check_interval);
        let mut cleanup_tick = tokio::time::interval(gateway.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = timeout_tick.tick() => {
                    gateway.correlator.sweep_timeouts();
                }
                _ = cleanup_tick.tick() => {
                    gateway.correlator.sweep_retention(gateway.config.response_retention);
                    gateway.correlator.sweep_dedup();
                    gateway.auth.challenges().purge_expired();
                    let _ = gateway.auth.sessions().purge_expired();
                }
            }
        }
    }

    /// Rate-limiter janitor.
    async fn run_janitor(gateway: Arc<Self>) {
        let mut tick = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            tick.tick().await;
            gateway.limiter.purge_expired();
        }
    }

    /// Periodic health check; critical status triggers the emergency
    /// sweep.
    async fn run_monitor(gateway: Arc<Self>) {
        let mut tick = tokio::time::interval(gateway.config.health_check_interval);
        loop {
            tick.tick().await;
            let snapshot = gateway.monitor.check();
            if snapshot.status == HealthStatus::Critical {
                gateway.emergency_sweep();
            }
        }
    }

    /// Force-timeout stale requests and run every sweep immediately.
    pub fn emergency_sweep(&self) {
        let stale_age = self.config.request_timeout * 2;
        let forced = self.correlator.force_timeout_older_than(stale_age);
        self.correlator.sweep_timeouts();
        self.correlator
            .sweep_retention(self.config.response_retention);
        self.correlator.sweep_dedup();
        debug!(forced, "Emergency sweep completed");
    }
}

// ============================================================================
// Gateway - Accessors
// ============================================================================

impl Gateway {
    /// Gateway configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Auth manager.
    #[inline]
    #[must_use]
    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// Rate limiter.
    #[inline]
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Audit sink.
    #[inline]
    #[must_use]
    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Process-wide event bus.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Extension hub.
    #[inline]
    #[must_use]
    pub fn extensions(&self) -> &Arc<ExtensionHub> {
        &self.extensions
    }

    /// Client hub.
    #[inline]
    #[must_use]
    pub fn clients(&self) -> &Arc<ClientHub> {
        &self.clients
    }

    /// Correlator.
    #[inline]
    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Resource monitor.
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Bound WebSocket address.
    #[inline]
    #[must_use]
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Bound HTTP address.
    #[inline]
    #[must_use]
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Returns `true` once shutdown began.
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Gateway - Tab & Cookie State
// ============================================================================

impl Gateway {
    /// Records a tab snapshot pushed by an extension.
    pub fn update_snapshot(&self, tabs: Value, active_tab_id: Option<i64>) {
        let mut snapshot = self.snapshot.lock();
        snapshot.tabs = Some(tabs);
        snapshot.active_tab_id = active_tab_id;
    }

    /// Returns the last tab snapshot as `{tabs, active_tab_id}`.
    #[must_use]
    pub fn tab_snapshot(&self) -> Value {
        let snapshot = self.snapshot.lock();
        json!({
            "tabs": snapshot.tabs.clone().unwrap_or_else(|| json!([])),
            "active_tab_id": snapshot.active_tab_id,
        })
    }

    /// Records the cookies from the latest `get_cookies` completion.
    pub fn update_cookies(&self, cookies: Vec<Value>) {
        *self.cookies.lock() = cookies;
    }

    /// Returns the cached cookies with the given filters applied.
    #[must_use]
    pub fn cookies(
        &self,
        domain: Option<&str>,
        name: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<Value> {
        self.cookies
            .lock()
            .iter()
            .filter(|cookie| {
                domain.is_none_or(|d| {
                    cookie["domain"].as_str().is_some_and(|cd| cd.contains(d))
                }) && name.is_none_or(|n| cookie["name"].as_str() == Some(n))
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

// ============================================================================
// Gateway - Shutdown
// ============================================================================

impl Gateway {
    /// Stops the gateway: closes every socket with 1000, clears all
    /// tables, and stops every periodic task.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Gateway shutting down");

        self.extensions.close_all(1000, "Server shutting down");
        self.clients.close_all(1000, "Server shutting down");

        self.correlator.shutdown();
        self.auth.clear();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock();
            guard.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }

        self.audit.record(AuditRecord::new(AuditKind::Shutdown));
        info!(stopped_tasks = tasks.len(), "Gateway shutdown complete");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        // Tasks hold Arc<Gateway>, so Drop only runs after they are gone;
        // abort here is a no-op safety net for direct construction in
        // tests.
        for task in self.tasks.lock().iter() {
            task.abort();
        }
    }
}
