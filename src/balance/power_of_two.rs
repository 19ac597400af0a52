//! Power-of-two-choices strategy.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::constants;
use crate::registry::ServerState;

use super::Algorithm;

/// Samples two distinct servers uniformly at random and returns the one
/// with the lower load score. Near-optimal balancing at O(1) cost.
pub struct PowerOfTwo;

impl PowerOfTwo {
    pub fn new() -> Self {
        Self
    }

    pub(super) fn score(state: &ServerState) -> f64 {
        let derived = state.derived_metrics();
        let baseline = Duration::from_millis(constants::RESPONSE_BASELINE_MS);

        let mut score = state.active_connections() as f64 / state.effective_weight();
        if derived.p95 > Duration::ZERO {
            score += derived.p95.as_secs_f64() / baseline.as_secs_f64();
        }
        score + derived.error_rate * 5.0
    }
}

impl Default for PowerOfTwo {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for PowerOfTwo {
    fn select(
        &self,
        candidates: &[Arc<ServerState>],
        _client_identity: &str,
    ) -> Option<Arc<ServerState>> {
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].clone()),
            len => {
                let mut rng = rand::thread_rng();
                let first = rng.gen_range(0..len);
                let mut second = rng.gen_range(0..len);
                while second == first {
                    second = rng.gen_range(0..len);
                }

                let a = &candidates[first];
                let b = &candidates[second];
                if Self::score(a) <= Self::score(b) {
                    Some(a.clone())
                } else {
                    Some(b.clone())
                }
            }
        }
    }
}
