//! Least-connections strategy with latency and error penalties.

use std::sync::Arc;
use std::time::Duration;

use crate::constants;
use crate::registry::ServerState;

use super::Algorithm;

/// Scores each candidate by in-flight load per unit of effective weight,
/// penalised for high p95 latency and error rate. Lowest score wins.
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }

    pub(super) fn score(state: &ServerState) -> f64 {
        let derived = state.derived_metrics();
        let baseline = Duration::from_millis(constants::RESPONSE_BASELINE_MS);

        let mut score = state.active_connections() as f64 / state.effective_weight();
        if derived.p95 > Duration::ZERO {
            score += derived.p95.as_secs_f64() / baseline.as_secs_f64() * 0.3;
        }
        score + derived.error_rate * 10.0
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for LeastConnections {
    fn select(
        &self,
        candidates: &[Arc<ServerState>],
        _client_identity: &str,
    ) -> Option<Arc<ServerState>> {
        candidates
            .iter()
            .min_by(|a, b| Self::score(a).total_cmp(&Self::score(b)))
            .cloned()
    }
}
