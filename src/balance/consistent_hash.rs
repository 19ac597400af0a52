//! Consistent-hash strategy with virtual nodes and failover.
//!
//! Each server occupies 150 positions on a hash ring, keyed by the MD5
//! digest of `"url#index"` (first four bytes as a 32-bit big-endian value).
//! A client identity hashes to a ring position and walks clockwise to the
//! first node. This gives:
//!
//! - **Stability**: the same client maps to the same server while that
//!   server stays healthy
//! - **Minimal redistribution**: adding or removing a server remaps only a
//!   bounded fraction of clients
//!
//! If the owning server is Unhealthy or its circuit is Open, selection
//! falls back to least connections.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants;
use crate::registry::{BreakerState, HealthState, ServerState};

use super::{Algorithm, LeastConnections};

#[derive(Debug, Default)]
struct HashRing {
    /// Virtual-node positions, sorted by hash for binary search.
    positions: Vec<(u32, String)>,
    /// Sorted member URLs; the rebuild fingerprint.
    members: Vec<String>,
}

/// Consistent hashing over the eligible set, with LC failover.
pub struct ConsistentHash {
    virtual_nodes: usize,
    ring: RwLock<HashRing>,
    fallback: LeastConnections,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self::with_virtual_nodes(constants::VIRTUAL_NODES_PER_SERVER)
    }

    /// Create a ring with a custom virtual-node count (at least 1).
    pub fn with_virtual_nodes(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: RwLock::new(HashRing::default()),
            fallback: LeastConnections::new(),
        }
    }

    fn hash_key(key: &str) -> u32 {
        let digest = md5::compute(key.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Rebuild the ring iff the candidate membership changed.
    fn sync_ring(&self, candidates: &[Arc<ServerState>]) {
        let mut members: Vec<String> =
            candidates.iter().map(|s| s.url().to_string()).collect();
        members.sort_unstable();

        {
            let ring = self.ring.read();
            if ring.members == members {
                return;
            }
        }

        let mut positions = Vec::with_capacity(members.len() * self.virtual_nodes);
        for url in &members {
            for index in 0..self.virtual_nodes {
                positions.push((Self::hash_key(&format!("{url}#{index}")), url.clone()));
            }
        }
        positions.sort_unstable_by_key(|(hash, _)| *hash);

        *self.ring.write() = HashRing { positions, members };
    }

    /// URL owning the given key, walking clockwise with wrap-around.
    fn owner(&self, key: &str) -> Option<String> {
        let ring = self.ring.read();
        if ring.positions.is_empty() {
            return None;
        }
        let hash = Self::hash_key(key);
        let index = ring
            .positions
            .partition_point(|(position, _)| *position < hash);
        let (_, url) = if index == ring.positions.len() {
            &ring.positions[0]
        } else {
            &ring.positions[index]
        };
        Some(url.clone())
    }

    /// Total virtual nodes currently on the ring.
    pub fn ring_size(&self) -> usize {
        self.ring.read().positions.len()
    }
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for ConsistentHash {
    fn select(
        &self,
        candidates: &[Arc<ServerState>],
        client_identity: &str,
    ) -> Option<Arc<ServerState>> {
        if candidates.is_empty() {
            return None;
        }

        self.sync_ring(candidates);

        if let Some(owner_url) = self.owner(client_identity)
            && let Some(owner) = candidates.iter().find(|s| s.url() == owner_url)
            && owner.health_state() != HealthState::Unhealthy
            && owner.breaker_state() != BreakerState::Open
        {
            return Some(owner.clone());
        }

        self.fallback.select(candidates, client_identity)
    }
}
