//! Selection engine.
//!
//! Given a pool and a client identity, returns one eligible server under
//! the currently active algorithm. Six algorithms are available:
//!
//! - Adaptive weighted round robin (smoothed, nginx scheme; default)
//! - Least connections
//! - Least response time
//! - Consistent hash (150 virtual nodes per server)
//! - Power of two choices
//! - Weighted fair queue
//!
//! The active algorithm is arbitrated by the [`AdaptiveController`], which
//! scores algorithms from fleet-wide metrics on a sliding window and swaps
//! the active one only when a candidate clearly outperforms it.

mod adaptive;
mod adaptive_wrr;
mod consistent_hash;
mod fair_queue;
mod least_connections;
mod power_of_two;
mod response_time;

#[cfg(test)]
mod property_tests;

pub use adaptive::{AdaptiveConfig, AdaptiveController};
pub use adaptive_wrr::AdaptiveWeighted;
pub use consistent_hash::ConsistentHash;
pub use fair_queue::WeightedFairQueue;
pub use least_connections::LeastConnections;
pub use power_of_two::PowerOfTwo;
pub use response_time::LeastResponseTime;

use std::sync::Arc;
use std::time::Instant;

use crate::registry::{Registry, ServerState};

/// A selection strategy over a set of eligible servers.
///
/// Strategies are stateless or lightly stateful; any internal bookkeeping
/// (weight accumulators, hash rings, virtual clocks) lives behind short
/// locks so `select` can run concurrently on many request tasks.
pub trait Algorithm: Send + Sync {
    /// Pick one server from the candidates, or none.
    fn select(
        &self,
        candidates: &[Arc<ServerState>],
        client_identity: &str,
    ) -> Option<Arc<ServerState>>;

    /// Refresh derived weights. Most strategies read live state directly
    /// and need no refresh.
    fn update_weights(&self, _candidates: &[Arc<ServerState>]) {}
}

/// Identifier of a selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    AdaptiveWeighted,
    LeastConnections,
    LeastResponseTime,
    ConsistentHash,
    PowerOfTwo,
    WeightedFairQueue,
}

impl AlgorithmKind {
    /// All strategies, in stable evaluation order.
    pub const ALL: [Self; 6] = [
        Self::AdaptiveWeighted,
        Self::LeastConnections,
        Self::LeastResponseTime,
        Self::ConsistentHash,
        Self::PowerOfTwo,
        Self::WeightedFairQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdaptiveWeighted => "adaptive_weighted",
            Self::LeastConnections => "least_connections",
            Self::LeastResponseTime => "least_response_time",
            Self::ConsistentHash => "consistent_hash",
            Self::PowerOfTwo => "power_of_two",
            Self::WeightedFairQueue => "weighted_fair_queue",
        }
    }

    pub(crate) fn index(self) -> u8 {
        match self {
            Self::AdaptiveWeighted => 0,
            Self::LeastConnections => 1,
            Self::LeastResponseTime => 2,
            Self::ConsistentHash => 3,
            Self::PowerOfTwo => 4,
            Self::WeightedFairQueue => 5,
        }
    }

    pub(crate) fn from_index(index: u8) -> Self {
        match index {
            1 => Self::LeastConnections,
            2 => Self::LeastResponseTime,
            3 => Self::ConsistentHash,
            4 => Self::PowerOfTwo,
            5 => Self::WeightedFairQueue,
            _ => Self::AdaptiveWeighted,
        }
    }
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The selection engine: eligibility filtering plus algorithm dispatch.
pub struct Selector {
    registry: Arc<Registry>,
    controller: AdaptiveController,
    adaptive_weighted: AdaptiveWeighted,
    least_connections: LeastConnections,
    least_response_time: LeastResponseTime,
    consistent_hash: ConsistentHash,
    power_of_two: PowerOfTwo,
    fair_queue: WeightedFairQueue,
}

impl Selector {
    /// Create a selector over a registry with default adaptive settings.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_adaptive_config(registry, AdaptiveConfig::default())
    }

    /// Create a selector with custom controller settings.
    pub fn with_adaptive_config(registry: Arc<Registry>, config: AdaptiveConfig) -> Self {
        Self {
            registry,
            controller: AdaptiveController::new(config),
            adaptive_weighted: AdaptiveWeighted::new(),
            least_connections: LeastConnections::new(),
            least_response_time: LeastResponseTime::new(),
            consistent_hash: ConsistentHash::new(),
            power_of_two: PowerOfTwo::new(),
            fair_queue: WeightedFairQueue::new(),
        }
    }

    /// Select one eligible server from a pool for the given client.
    ///
    /// On success the chosen server's request counter and in-flight count
    /// are bumped; the caller must record an outcome for it exactly once.
    pub fn select(&self, pool: &str, client_identity: &str) -> Option<Arc<ServerState>> {
        let now = Instant::now();
        let candidates = self.registry.eligible_servers(pool, now);
        if candidates.is_empty() {
            return None;
        }

        let kind = self.controller.active();
        let chosen = self.algorithm(kind).select(&candidates, client_identity)?;
        chosen.begin_request();
        Some(chosen)
    }

    /// The controller arbitrating which algorithm is active.
    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    /// The registry this selector draws candidates from.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn algorithm(&self, kind: AlgorithmKind) -> &dyn Algorithm {
        match kind {
            AlgorithmKind::AdaptiveWeighted => &self.adaptive_weighted,
            AlgorithmKind::LeastConnections => &self.least_connections,
            AlgorithmKind::LeastResponseTime => &self.least_response_time,
            AlgorithmKind::ConsistentHash => &self.consistent_hash,
            AlgorithmKind::PowerOfTwo => &self.power_of_two,
            AlgorithmKind::WeightedFairQueue => &self.fair_queue,
        }
    }
}
