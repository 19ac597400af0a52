//! Adaptive smoothed weighted round robin (the default strategy).
//!
//! Implements the nginx smooth weighted scheme: per call every candidate's
//! current weight grows by its effective weight, the highest current weight
//! wins, and the winner's current weight drops by the sum of all effective
//! weights. The result is strictly proportional selection with no bursts.
//!
//! Effective weights are re-derived from live performance every few seconds:
//! the configured weight is scaled by error-rate, response-time, connection
//! and health factors, floored so no server starves entirely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::constants;
use crate::registry::{HealthState, ServerState};

use super::Algorithm;

/// Smoothed weighted round robin with performance-derived weights.
pub struct AdaptiveWeighted {
    last_refresh: Mutex<Option<Instant>>,
}

impl AdaptiveWeighted {
    pub fn new() -> Self {
        Self {
            last_refresh: Mutex::new(None),
        }
    }

    fn refresh_interval() -> Duration {
        Duration::from_secs(constants::WEIGHT_REFRESH_SECS)
    }

    /// Re-derive one server's effective weight from its live metrics.
    fn refresh_server(state: &ServerState) {
        let derived = state.derived_metrics();
        let base = f64::from(state.weight());

        let error_factor = if derived.error_rate > 0.0 {
            (1.0 - derived.error_rate * 2.0).max(constants::EFFECTIVE_WEIGHT_FLOOR)
        } else {
            1.0
        };

        let baseline = Duration::from_millis(constants::RESPONSE_BASELINE_MS);
        let response_factor = if derived.p95 > Duration::ZERO {
            if derived.p95 > baseline {
                (baseline.as_secs_f64() / derived.p95.as_secs_f64())
                    .max(constants::EFFECTIVE_WEIGHT_FLOOR)
            } else {
                // Bonus for fast servers.
                1.2
            }
        } else {
            1.0
        };

        let active = state.active_connections();
        let conn_factor = if active > 0 {
            (1.0 - active as f64 / f64::from(state.max_connections()))
                .max(constants::EFFECTIVE_WEIGHT_FLOOR)
        } else {
            1.0
        };

        let health_factor = match state.health_state() {
            HealthState::Healthy => 1.0,
            HealthState::Degraded => 0.7,
            HealthState::Recovering => 0.5,
            HealthState::Unhealthy => 0.1,
        };

        let effective = (base * error_factor * response_factor * conn_factor * health_factor)
            .max(constants::EFFECTIVE_WEIGHT_FLOOR);
        state.scheduling().effective = effective;
    }
}

impl Default for AdaptiveWeighted {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for AdaptiveWeighted {
    fn select(
        &self,
        candidates: &[Arc<ServerState>],
        _client_identity: &str,
    ) -> Option<Arc<ServerState>> {
        if candidates.is_empty() {
            return None;
        }

        self.update_weights(candidates);

        let mut total_effective = 0.0;
        let mut best: Option<(usize, f64)> = None;
        for (i, state) in candidates.iter().enumerate() {
            let mut weights = state.scheduling();
            weights.current += weights.effective;
            total_effective += weights.effective;
            let current = weights.current;
            drop(weights);

            if best.is_none_or(|(_, best_current)| current > best_current) {
                best = Some((i, current));
            }
        }

        let (index, _) = best?;
        let winner = &candidates[index];
        winner.scheduling().current -= total_effective;
        Some(winner.clone())
    }

    fn update_weights(&self, candidates: &[Arc<ServerState>]) {
        let now = Instant::now();
        {
            let mut last = self.last_refresh.lock();
            if last.is_some_and(|t| now.duration_since(t) < Self::refresh_interval()) {
                return;
            }
            *last = Some(now);
        }

        for state in candidates {
            Self::refresh_server(state);
        }
    }
}
