//! Graceful server removal.
//!
//! A removal marks the server inactive immediately (no new selections),
//! then polls its in-flight connection count once per second. When the
//! count reaches zero, or the drain deadline passes, the removal is
//! finalized: the drained and removed callbacks fire exactly once each and
//! the server leaves the registry. Until then the server stays rostered so
//! in-flight requests can still record outcomes against it.


use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::constants;
use crate::registry::{Registry, ServerState};

/// Callback invoked with the server URL when a drain milestone is reached.
pub type LifecycleCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Drain tunables.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Maximum time a draining server may hold in-flight requests.
    pub drain_timeout: Duration,
    /// Interval between in-flight checks.
    pub check_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(constants::DRAIN_TIMEOUT_SECS),
            check_interval: Duration::from_secs(constants::DRAIN_CHECK_INTERVAL_SECS),
        }
    }
}

/// An in-progress graceful drain.
#[derive(Clone)]
struct Removal {
    state: Arc<ServerState>,
    started_at: Instant,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

/// Public view of one draining server.
#[derive(Debug, Clone)]
pub struct DrainStatus {
    pub url: String,
    pub started_at: Instant,
    pub deadline: Instant,
    pub in_flight: i64,
}

/// Coordinates graceful removals against the registry.
pub struct Lifecycle {
    registry: Arc<Registry>,
    config: LifecycleConfig,
    pending: Mutex<HashMap<String, Removal>>,
    on_drained: Mutex<Option<LifecycleCallback>>,
    on_removed: Mutex<Option<LifecycleCallback>>,
}

impl Lifecycle {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, LifecycleConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: LifecycleConfig) -> Self {
        Self {
            registry,
            config,
            pending: Mutex::new(HashMap::new()),
            on_drained: Mutex::new(None),
            on_removed: Mutex::new(None),
        }
    }

    /// Install the drained/removed callbacks.
    pub fn set_callbacks(
        &self,
        on_drained: impl Fn(&str) + Send + Sync + 'static,
        on_removed: impl Fn(&str) + Send + Sync + 'static,
    ) {
        *self.on_drained.lock() = Some(Box::new(on_drained));
        *self.on_removed.lock() = Some(Box::new(on_removed));
    }

    /// Begin a graceful removal.
    ///
    /// Returns false (and does nothing) if the server is unknown or already
    /// draining. Otherwise the server is deactivated immediately and a
    /// monitor task polls its in-flight count until drain or deadline.
    pub fn start_graceful_removal(self: &Arc<Self>, url: &str) -> bool {
        let Some(state) = self.registry.server(url) else {
            debug!(url, "graceful removal requested for unknown server");
            return false;
        };

        let removal = {
            let mut pending = self.pending.lock();
            if pending.contains_key(url) {
                return false;
            }
            let now = Instant::now();
            let removal = Removal {
                state: state.clone(),
                started_at: now,
                deadline: now + self.config.drain_timeout,
                cancelled: Arc::new(AtomicBool::new(false)),
            };
            pending.insert(url.to_string(), removal.clone());
            removal
        };

        // No new selections while draining; in-flight traffic continues.
        state.set_active(false);
        info!(
            url,
            in_flight = state.active_connections(),
            timeout_secs = self.config.drain_timeout.as_secs(),
            "draining server"
        );

        let lifecycle = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            lifecycle.monitor_drain(&url, removal).await;
        });
        true
    }

    async fn monitor_drain(self: Arc<Self>, url: &str, removal: Removal) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        // The first tick fires immediately; skip it so a server with
        // in-flight requests gets at least one full interval to drain.
        interval.tick().await;

        loop {
            interval.tick().await;

            if removal.cancelled.load(Ordering::Acquire) {
                return;
            }

            let in_flight = removal.state.active_connections();
            let now = Instant::now();
            if in_flight <= 0 || now >= removal.deadline {
                if in_flight > 0 {
                    warn!(url, in_flight, "drain deadline passed, removing anyway");
                }
                self.finalize(url, &removal);
                return;
            }
            debug!(url, in_flight, "still draining");
        }
    }

    /// Complete a drain: fire callbacks once and drop the server from the
    /// registry. The pending-map removal is the exactly-once gate.
    fn finalize(&self, url: &str, removal: &Removal) {
        let owned = {
            let mut pending = self.pending.lock();
            pending.remove(url).is_some()
        };
        if !owned || removal.cancelled.load(Ordering::Acquire) {
            return;
        }

        // Callbacks and registry mutation happen outside our lock.
        if let Some(callback) = self.on_drained.lock().as_ref() {
            callback(url);
        }
        if let Some(callback) = self.on_removed.lock().as_ref() {
            callback(url);
        }
        self.registry.remove_server(url);
        info!(
            url,
            drained_in_ms = removal.started_at.elapsed().as_millis() as u64,
            "server drained and removed"
        );
    }

    /// True if the URL is currently draining.
    pub fn is_draining(&self, url: &str) -> bool {
        self.pending.lock().contains_key(url)
    }

    /// All draining servers.
    pub fn list_draining(&self) -> Vec<DrainStatus> {
        self.pending
            .lock()
            .iter()
            .map(|(url, removal)| DrainStatus {
                url: url.clone(),
                started_at: removal.started_at,
                deadline: removal.deadline,
                in_flight: removal.state.active_connections(),
            })
            .collect()
    }

    /// Abort a drain and reactivate the server. Returns false if the URL
    /// was not draining.
    pub fn cancel_removal(&self, url: &str) -> bool {
        let removal = self.pending.lock().remove(url);
        match removal {
            Some(removal) => {
                removal.cancelled.store(true, Ordering::Release);
                removal.state.set_active(true);
                info!(url, "drain cancelled, server reactivated");
                true
            }
            None => false,
        }
    }

    /// Remove a draining server immediately, without waiting for in-flight
    /// requests. Fires only the removed callback.
    pub fn force_removal(&self, url: &str) -> bool {
        let removal = self.pending.lock().remove(url);
        let Some(removal) = removal else {
            return false;
        };
        removal.cancelled.store(true, Ordering::Release);

        if let Some(callback) = self.on_removed.lock().as_ref() {
            callback(url);
        }
        self.registry.remove_server(url);
        warn!(url, "server forcefully removed");
        true
    }
}
