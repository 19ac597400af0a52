//! Adaptive controller arbitrating which selection algorithm is active.
//!
//! Algorithms are scored from fleet-wide metrics: error rate, average
//! response time, throughput, and how evenly requests spread across the
//! fleet. Scoring runs at most once per evaluation window, and the active
//! algorithm only changes when a candidate beats it by a clear margin, so
//! a noisy workload with two near-tied algorithms doesn't flap.
//!
//! The active algorithm identifier is read lock-free on the selection hot
//! path; the score table sits behind its own mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::constants;
use crate::registry::GlobalView;

use super::AlgorithmKind;

/// Controller tunables.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// Minimum time between score evaluations.
    pub evaluation_window: Duration,
    /// Margin a candidate's score must exceed the active one's by.
    pub switch_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            evaluation_window: Duration::from_secs(constants::EVALUATION_WINDOW_SECS),
            switch_threshold: constants::SWITCH_THRESHOLD,
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    /// Most recent score observed per algorithm while it was active.
    observed: HashMap<AlgorithmKind, f64>,
    /// Scores from the last evaluation pass.
    scores: HashMap<AlgorithmKind, f64>,
    last_evaluation: Option<Instant>,
    last_switch: Option<Instant>,
}

/// Periodically scores every algorithm and swaps the active one when a
/// candidate clearly outperforms it.
pub struct AdaptiveController {
    active: AtomicU8,
    config: AdaptiveConfig,
    state: Mutex<ControllerState>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            active: AtomicU8::new(AlgorithmKind::AdaptiveWeighted.index()),
            config,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// The currently active algorithm. Lock-free; safe on the hot path.
    pub fn active(&self) -> AlgorithmKind {
        AlgorithmKind::from_index(self.active.load(Ordering::Acquire))
    }

    /// Score a fleet-wide metrics view.
    ///
    /// Four weighted terms: inverse error rate (30%), response time under
    /// one second (30%), throughput toward 1000 rps (20%), and request
    /// spread across servers via the coefficient of variation (20%).
    pub fn score_for(view: &GlobalView) -> f64 {
        let error_rate_score = (1.0 - view.error_rate) * 0.30;

        let response_time_score = if view.avg_response_time > Duration::ZERO {
            (1.0 - view.avg_response_time.as_secs_f64()).max(0.0) * 0.30
        } else {
            0.0
        };

        let throughput_score = (view.requests_per_second / 1000.0).min(1.0) * 0.20;

        let balance_score = Self::balance_score(&view.per_server_requests) * 0.20;

        error_rate_score + response_time_score + throughput_score + balance_score
    }

    fn balance_score(per_server_requests: &[u64]) -> f64 {
        if per_server_requests.len() < 2 {
            return 1.0;
        }
        let loads: Vec<f64> = per_server_requests.iter().map(|&n| n as f64).collect();
        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        if mean == 0.0 {
            return 1.0;
        }
        let variance =
            loads.iter().map(|load| (load - mean).powi(2)).sum::<f64>() / loads.len() as f64;
        let cv = variance.sqrt() / mean;
        (1.0 - cv).max(0.0)
    }

    /// Record a metrics observation attributed to an algorithm, normally
    /// the one that was active while the metrics accumulated.
    pub fn observe(&self, kind: AlgorithmKind, view: &GlobalView) {
        self.state.lock().observed.insert(kind, Self::score_for(view));
    }

    /// Run an evaluation pass if the window has elapsed.
    ///
    /// Returns true when the active algorithm changed. Between windows the
    /// active algorithm is fixed and readable without locking.
    pub fn maybe_evaluate(&self, view: &GlobalView) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state
            .last_evaluation
            .is_some_and(|t| now.duration_since(t) < self.config.evaluation_window)
        {
            return false;
        }
        state.last_evaluation = Some(now);

        let fallback = Self::score_for(view);
        for kind in AlgorithmKind::ALL {
            let score = state.observed.get(&kind).copied().unwrap_or(fallback);
            state.scores.insert(kind, score);
        }

        let current = self.active();
        let current_score = state.scores.get(&current).copied().unwrap_or(fallback);
        let (best, best_score) = AlgorithmKind::ALL
            .iter()
            .map(|kind| (*kind, state.scores.get(kind).copied().unwrap_or(fallback)))
            .fold((current, current_score), |acc, item| {
                if item.1 > acc.1 { item } else { acc }
            });

        if best != current && best_score - current_score > self.config.switch_threshold {
            self.active.store(best.index(), Ordering::Release);
            state.last_switch = Some(now);
            info!(
                from = %current,
                to = %best,
                margin = best_score - current_score,
                "switching selection algorithm"
            );
            true
        } else {
            debug!(active = %current, score = current_score, "algorithm retained");
            false
        }
    }

    /// Scores from the last evaluation pass, for observability.
    pub fn scores(&self) -> HashMap<AlgorithmKind, f64> {
        self.state.lock().scores.clone()
    }

    /// When the controller last switched algorithms.
    pub fn last_switch(&self) -> Option<Instant> {
        self.state.lock().last_switch
    }
}

impl Default for AdaptiveController {
    fn default() -> Self {
        Self::new(AdaptiveConfig::default())
    }
}
