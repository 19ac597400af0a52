//! Weighted fair queueing strategy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::constants;
use crate::registry::ServerState;

use super::Algorithm;

#[derive(Debug, Default)]
struct FairQueueState {
    /// Virtual finish time per server URL.
    virtual_time: HashMap<String, f64>,
    last_normalize: Option<Instant>,
}

/// Tracks a floating-point virtual time per server; each selection picks
/// the lowest clock and advances it by the inverse of the server's
/// effective weight, so heavier servers accumulate time more slowly and
/// are scheduled proportionally more often.
pub struct WeightedFairQueue {
    inner: Mutex<FairQueueState>,
}

impl WeightedFairQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FairQueueState::default()),
        }
    }

    /// Shift all clocks down once the minimum climbs past the threshold,
    /// and drop entries for servers no longer in the candidate set.
    fn normalize(state: &mut FairQueueState, candidates: &[Arc<ServerState>]) {
        state
            .virtual_time
            .retain(|url, _| candidates.iter().any(|c| c.url() == url));

        let min = state
            .virtual_time
            .values()
            .copied()
            .fold(f64::INFINITY, f64::min);
        if min.is_finite() && min > constants::FAIR_QUEUE_NORMALIZE_THRESHOLD {
            for value in state.virtual_time.values_mut() {
                *value -= min;
            }
        }
    }
}

impl Default for WeightedFairQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for WeightedFairQueue {
    fn select(
        &self,
        candidates: &[Arc<ServerState>],
        _client_identity: &str,
    ) -> Option<Arc<ServerState>> {
        if candidates.is_empty() {
            return None;
        }

        let mut state = self.inner.lock();

        let now = Instant::now();
        if state
            .last_normalize
            .is_none_or(|t| now.duration_since(t) > Duration::from_secs(1))
        {
            Self::normalize(&mut state, candidates);
            state.last_normalize = Some(now);
        }

        let mut selected: Option<(usize, f64)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let clock = *state
                .virtual_time
                .entry(candidate.url().to_string())
                .or_insert(0.0);
            if selected.is_none_or(|(_, lowest)| clock < lowest) {
                selected = Some((i, clock));
            }
        }

        let (index, _) = selected?;
        let winner = &candidates[index];
        *state
            .virtual_time
            .entry(winner.url().to_string())
            .or_insert(0.0) += 1.0 / winner.effective_weight();
        Some(winner.clone())
    }
}
