//! Server State Registry.
//!
//! Authoritative per-server state for the whole fleet. The registry owns:
//!
//! - The roster map (url -> [`ServerState`]) behind a reader-writer lock
//! - Pool definitions (ordered server membership plus per-pool options)
//! - Outcome recording, which drives breakers, health and derived metrics
//! - Consistent snapshots for observers
//!
//! Selection holds the read lock only while enumerating candidates; it is
//! never held across network I/O. Reconfiguration takes the write lock and
//! applies the whole delta atomically.

mod breaker;
mod ring;
mod server;


pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use ring::RingBuffer;
pub use server::{
    DerivedMetrics, HealthState, SchedulingWeights, Server, ServerState, ServerStateView,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants;
use crate::error::{Error, Result};

/// Per-pool options carried alongside the roster.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Health-check path probed on every server of the pool.
    pub health_check: String,
    /// Selection attempts beyond the first.
    pub retries: u32,
    pub sticky_sessions: bool,
    /// Outbound request timeout.
    pub timeout: Duration,
    /// Interval between health-check cycles.
    pub health_interval: Duration,
    /// Fleet-size bounds, honored opaquely for the scaling collaborator.
    pub min_servers: u32,
    pub max_servers: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            health_check: String::new(),
            retries: constants::DEFAULT_RETRIES,
            sticky_sessions: false,
            timeout: Duration::from_secs(constants::DEFAULT_TIMEOUT_SECS),
            health_interval: Duration::from_secs(constants::HEALTH_CHECK_INTERVAL_SECS),
            min_servers: 0,
            max_servers: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Pool {
    name: String,
    server_urls: Vec<String>,
    options: PoolOptions,
}

/// Aggregated fleet metrics consumed by the adaptive controller.
#[derive(Debug, Clone, Default)]
pub struct GlobalView {
    pub error_rate: f64,
    pub avg_response_time: Duration,
    pub requests_per_second: f64,
    /// Per-server lifetime request counts, for the balance score.
    pub per_server_requests: Vec<u64>,
}

/// The fleet's authoritative state store.
#[derive(Debug, Default)]
pub struct Registry {
    servers: RwLock<HashMap<String, Arc<ServerState>>>,
    pools: RwLock<Vec<Pool>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a full configuration: upsert every backend's servers and
    /// replace the pool definitions. Rejected without touching live state
    /// if it would leave the registry empty.
    pub fn apply_config(&self, config: &Config) -> Result<()> {
        let mut roster: Vec<(Server, BreakerConfig)> = Vec::new();
        let mut pools = Vec::with_capacity(config.backends.len());

        for backend in &config.backends {
            let breaker_config = BreakerConfig::from(&backend.circuit_breaker);
            for server_cfg in &backend.servers {
                roster.push((Server::from(server_cfg), breaker_config.clone()));
            }
            pools.push(Pool {
                name: backend.name.clone(),
                server_urls: backend.servers.iter().map(|s| s.url.clone()).collect(),
                options: PoolOptions {
                    health_check: backend.health_check.clone(),
                    retries: backend.retries,
                    sticky_sessions: backend.sticky_sessions,
                    timeout: backend.timeout(),
                    health_interval: backend.health_interval(),
                    min_servers: backend.min_servers,
                    max_servers: backend.max_servers,
                },
            });
        }

        if roster.is_empty() {
            return Err(Error::Configuration(
                "configuration would leave the registry empty".to_string(),
            ));
        }

        self.upsert_with_breakers(&roster);
        *self.pools.write() = pools;
        Ok(())
    }

    /// Reconcile the roster against a full desired server list.
    ///
    /// Missing servers are inserted, existing ones have weight, connection
    /// cap, active flag and health endpoint updated in place (metrics and
    /// breaker state survive), and servers absent from the list are removed.
    pub fn upsert(&self, roster: &[Server]) -> Result<()> {
        if roster.is_empty() {
            return Err(Error::Configuration(
                "upsert with an empty roster would leave the registry empty".to_string(),
            ));
        }
        let with_breakers: Vec<(Server, BreakerConfig)> = roster
            .iter()
            .map(|s| (s.clone(), BreakerConfig::default()))
            .collect();
        self.upsert_with_breakers(&with_breakers);
        Ok(())
    }

    fn upsert_with_breakers(&self, roster: &[(Server, BreakerConfig)]) {
        let mut servers = self.servers.write();

        let mut desired: HashSet<&str> = HashSet::with_capacity(roster.len());
        let mut added = 0usize;
        for (server, breaker_config) in roster {
            desired.insert(server.url.as_str());
            if let Some(existing) = servers.get(&server.url) {
                existing.set_weight(server.weight);
                existing.set_max_connections(server.max_connections);
                existing.set_active(server.active);
                existing.set_health_endpoint(server.health_check_endpoint.clone());
            } else {
                servers.insert(
                    server.url.clone(),
                    Arc::new(ServerState::new(server, breaker_config.clone())),
                );
                added += 1;
            }
        }

        let before = servers.len();
        servers.retain(|url, _| desired.contains(url.as_str()));
        let removed = before - servers.len();

        if added > 0 || removed > 0 {
            info!(added, removed, total = servers.len(), "roster updated");
        }
    }

    /// Remove one server outright. Used by the lifecycle manager after a
    /// drain completes; in-flight outcome recording for a removed URL is a
    /// no-op.
    pub fn remove_server(&self, url: &str) -> bool {
        let removed = self.servers.write().remove(url).is_some();
        if removed {
            for pool in self.pools.write().iter_mut() {
                pool.server_urls.retain(|u| u != url);
            }
            info!(url, "server removed from registry");
        }
        removed
    }

    /// Look up one server's live state.
    pub fn server(&self, url: &str) -> Option<Arc<ServerState>> {
        self.servers.read().get(url).cloned()
    }

    /// Number of rostered servers.
    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Name of the default pool (first in configuration order), if any.
    pub fn default_pool(&self) -> Option<String> {
        self.pools.read().first().map(|p| p.name.clone())
    }

    /// Options for a named pool.
    pub fn pool_options(&self, pool: &str) -> Option<PoolOptions> {
        self.pools
            .read()
            .iter()
            .find(|p| p.name == pool)
            .map(|p| p.options.clone())
    }

    /// Names of all configured pools, in configuration order.
    pub fn pool_names(&self) -> Vec<String> {
        self.pools.read().iter().map(|p| p.name.clone()).collect()
    }

    /// Member states of a named pool, in roster order. Falls back to the
    /// whole roster when no pools are configured (plain `upsert` usage).
    pub fn pool_servers(&self, pool: &str) -> Vec<Arc<ServerState>> {
        let (urls, no_pools) = {
            let pools = self.pools.read();
            (
                pools
                    .iter()
                    .find(|p| p.name == pool)
                    .map(|p| p.server_urls.clone()),
                pools.is_empty(),
            )
        };
        let servers = self.servers.read();
        match urls {
            Some(urls) => urls
                .iter()
                .filter_map(|url| servers.get(url).cloned())
                .collect(),
            None if no_pools => servers.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Members of a pool currently permitted for selection.
    ///
    /// Holds the roster read lock only for the enumeration itself.
    pub fn eligible_servers(&self, pool: &str, now: Instant) -> Vec<Arc<ServerState>> {
        self.pool_servers(pool)
            .into_iter()
            .filter(|s| s.is_eligible(now))
            .collect()
    }

    /// Record the outcome of a request against a server.
    ///
    /// Always decrements the server's in-flight count, matching the
    /// increment made at selection time. A URL no longer in the registry is
    /// ignored (the server was force-removed mid-flight).
    pub fn record_outcome(&self, url: &str, duration: Duration, success: bool) {
        let Some(state) = self.server(url) else {
            debug!(url, "outcome for unknown server dropped");
            return;
        };
        state.observe(duration, success, Instant::now());
        if !success && state.breaker_state() == BreakerState::Open {
            warn!(
                url,
                failures = state.failure_count(),
                "circuit open after failure"
            );
        }
    }

    /// Record an active health-probe result for a server.
    pub fn record_probe(&self, url: &str, healthy: bool) {
        if let Some(state) = self.server(url) {
            state.observe_probe(healthy, Instant::now());
        }
    }

    /// Read-only snapshot of one server.
    pub fn snapshot(&self, url: &str) -> Option<ServerStateView> {
        self.server(url).map(|s| s.view())
    }

    /// Read-only snapshot of every rostered server.
    pub fn snapshot_all(&self) -> HashMap<String, ServerStateView> {
        self.servers
            .read()
            .iter()
            .map(|(url, state)| (url.clone(), state.view()))
            .collect()
    }

    /// Aggregate fleet metrics for the adaptive controller.
    ///
    /// The response-time figure is the latency total divided by request
    /// count across servers, not a fleet percentile; per-server samples
    /// remain the authoritative latency source.
    pub fn global_view(&self, requests_per_second: f64) -> GlobalView {
        let servers = self.servers.read();
        let mut total_requests = 0u64;
        let mut total_failures = 0u64;
        let mut total_latency = Duration::ZERO;
        let mut per_server_requests = Vec::with_capacity(servers.len());

        for state in servers.values() {
            let requests = state.total_requests();
            total_requests += requests;
            total_failures += state.failure_count();
            total_latency += state.total_latency();
            per_server_requests.push(requests);
        }

        let error_rate = if total_requests > 0 {
            total_failures as f64 / total_requests as f64
        } else {
            0.0
        };
        let avg_response_time = if total_requests > 0 {
            total_latency / u32::try_from(total_requests).unwrap_or(u32::MAX)
        } else {
            Duration::ZERO
        };

        GlobalView {
            error_rate,
            avg_response_time,
            requests_per_second,
            per_server_requests,
        }
    }
}
