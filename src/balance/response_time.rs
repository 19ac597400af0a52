//! Least predicted response time strategy.

use std::sync::Arc;
use std::time::Duration;

use crate::constants;
use crate::registry::ServerState;

use super::Algorithm;

/// Predicts each candidate's response time from its p95 scaled by current
/// load and error rate, and picks the lowest prediction. Servers with no
/// samples yet get an optimistic default estimate.
pub struct LeastResponseTime;

impl LeastResponseTime {
    pub fn new() -> Self {
        Self
    }

    pub(super) fn predicted(state: &ServerState) -> f64 {
        let derived = state.derived_metrics();
        let base = if derived.p95 > Duration::ZERO {
            derived.p95
        } else {
            Duration::from_millis(constants::DEFAULT_RESPONSE_ESTIMATE_MS)
        };

        let load_factor = 1.0 + state.active_connections() as f64 * 0.1;
        let error_factor = 1.0 + derived.error_rate * 2.0;
        base.as_secs_f64() * load_factor * error_factor
    }
}

impl Default for LeastResponseTime {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for LeastResponseTime {
    fn select(
        &self,
        candidates: &[Arc<ServerState>],
        _client_identity: &str,
    ) -> Option<Arc<ServerState>> {
        candidates
            .iter()
            .min_by(|a, b| Self::predicted(a).total_cmp(&Self::predicted(b)))
            .cloned()
    }
}
