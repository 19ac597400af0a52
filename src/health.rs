//! Active health checks for backend servers.
//!
//! Probes every active server's health endpoint on its pool's interval and
//! feeds results into the registry's health classification. A successful
//! probe moves an Unhealthy server to Recovering (real traffic completes
//! the recovery); a failed probe marks the server Unhealthy immediately.
//!
//! Servers without a health endpoint (neither per-server nor pool-level)
//! are skipped; their health is driven by traffic outcomes alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants;
use crate::registry::Registry;

/// Background health prober.
pub struct HealthChecker {
    registry: Arc<Registry>,
    client: reqwest::Client,
}

impl HealthChecker {
    /// Create a prober with the standard per-probe timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(constants::HEALTH_PROBE_TIMEOUT_SECS))
            .pool_max_idle_per_host(1)
            .build()
            .context("failed to create health-check HTTP client")?;
        Ok(Self { registry, client })
    }

    /// Run probe cycles until the shutdown signal flips.
    ///
    /// Each pool is probed on its own configured interval; pools added by a
    /// reconfiguration are picked up automatically.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("health checker started");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut next_due: HashMap<String, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = Instant::now();
                    for pool in self.registry.pool_names() {
                        if next_due.get(&pool).is_none_or(|&due| now >= due) {
                            let interval = self
                                .registry
                                .pool_options(&pool)
                                .map(|o| o.health_interval)
                                .unwrap_or(Duration::from_secs(
                                    constants::HEALTH_CHECK_INTERVAL_SECS,
                                ));
                            self.check_pool(&pool).await;
                            next_due.insert(pool, now + interval);
                        }
                    }
                    next_due.retain(|pool, _| self.registry.pool_options(pool).is_some());
                }
                _ = shutdown.changed() => {
                    info!("health checker stopping");
                    return;
                }
            }
        }
    }

    /// Probe every active server of one pool concurrently.
    pub async fn check_pool(&self, pool: &str) {
        let Some(options) = self.registry.pool_options(pool) else {
            return;
        };

        let probes: Vec<_> = self
            .registry
            .pool_servers(pool)
            .into_iter()
            .filter(|state| state.is_active())
            .filter_map(|state| {
                let endpoint = state
                    .health_endpoint()
                    .unwrap_or_else(|| options.health_check.clone());
                if endpoint.is_empty() {
                    return None;
                }
                let url = state.url().to_string();
                let target = format!("{}{}", url.trim_end_matches('/'), endpoint);
                Some(async move {
                    let healthy = self.probe(&target).await;
                    (url, healthy)
                })
            })
            .collect();

        for (url, healthy) in join_all(probes).await {
            if !healthy {
                warn!(url, "health probe failed");
            } else {
                debug!(url, "health probe passed");
            }
            self.registry.record_probe(&url, healthy);
        }
    }

    async fn probe(&self, target: &str) -> bool {
        match self.client.get(target).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(target, error = %e, "probe error");
                false
            }
        }
    }
}
