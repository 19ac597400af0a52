//! Property-based tests for selection invariants.
//!
//! - Smoothed weighted round robin converges to the configured weight
//!   ratios and never starves or bursts a server
//! - Consistent hashing is stable for any identity and roster

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::balance::{AdaptiveWeighted, Algorithm, ConsistentHash};
    use crate::registry::{BreakerConfig, Server, ServerState};

    fn fleet(weights: &[u32]) -> Vec<Arc<ServerState>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                Arc::new(ServerState::new(
                    &Server::new(format!("http://10.1.0.{i}:80")).with_weight(w),
                    BreakerConfig::default(),
                ))
            })
            .collect()
    }

    fn weights_strategy() -> impl Strategy<Value = Vec<u32>> {
        prop::collection::vec(1u32..8, 2..5)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Selection frequencies converge to w_i / sum(w) as the number of
        /// selections grows, and no server is starved.
        #[test]
        fn smooth_wrr_converges_to_weight_ratios(weights in weights_strategy()) {
            let wrr = AdaptiveWeighted::new();
            let candidates = fleet(&weights);
            let total_weight: u32 = weights.iter().sum();
            let rounds = 200u32;
            let selections = total_weight * rounds;

            let mut counts: HashMap<String, u32> = HashMap::new();
            for _ in 0..selections {
                let chosen = wrr.select(&candidates, "client").unwrap();
                *counts.entry(chosen.url().to_string()).or_default() += 1;
            }

            for (i, state) in candidates.iter().enumerate() {
                let count = counts.get(state.url()).copied().unwrap_or(0);
                // With static weights the smooth scheme is exact per cycle.
                prop_assert_eq!(
                    count,
                    weights[i] * rounds,
                    "server {} expected {} of {} selections, got {}",
                    state.url(), weights[i] * rounds, selections, count
                );
            }
        }

        /// The maximum consecutive run of any server is bounded by its
        /// share of the total weight, so no server monopolises a cycle.
        #[test]
        fn smooth_wrr_bounds_consecutive_repeats(weights in weights_strategy()) {
            let wrr = AdaptiveWeighted::new();
            let candidates = fleet(&weights);
            let total_weight: u32 = weights.iter().sum();
            let max_weight: u32 = *weights.iter().max().unwrap();

            // A server can repeat at most ceil(max_w / (total_w - max_w))
            // times plus one boundary carry; use a generous bound.
            let bound = if total_weight == max_weight {
                u32::MAX
            } else {
                max_weight.div_ceil(total_weight - max_weight) + 1
            };

            let mut run = 0u32;
            let mut last: Option<String> = None;
            for _ in 0..(total_weight * 50) {
                let chosen = wrr.select(&candidates, "client").unwrap();
                if last.as_deref() == Some(chosen.url()) {
                    run += 1;
                    prop_assert!(
                        run <= bound,
                        "{} selected {} times in a row (bound {})",
                        chosen.url(), run, bound
                    );
                } else {
                    run = 1;
                }
                last = Some(chosen.url().to_string());
            }
        }

        /// Repeated selection for the same identity lands on the same
        /// server while the roster is unchanged and everything is healthy.
        #[test]
        fn consistent_hash_is_stable(
            identity in "[a-z0-9.]{1,24}",
            server_count in 2usize..6,
        ) {
            let ch = ConsistentHash::new();
            let candidates = fleet(&vec![1; server_count]);

            let first = ch.select(&candidates, &identity).unwrap();
            for _ in 0..20 {
                let again = ch.select(&candidates, &identity).unwrap();
                prop_assert_eq!(again.url(), first.url());
            }
        }

        /// Two independent ring instances agree on every mapping, so the
        /// mapping is a pure function of roster and identity.
        #[test]
        fn consistent_hash_is_deterministic_across_instances(
            identities in prop::collection::vec("[a-z0-9]{1,16}", 1..20),
            server_count in 2usize..6,
        ) {
            let first_ring = ConsistentHash::new();
            let second_ring = ConsistentHash::new();
            let candidates = fleet(&vec![1; server_count]);

            for identity in &identities {
                let a = first_ring.select(&candidates, identity).unwrap();
                let b = second_ring.select(&candidates, identity).unwrap();
                prop_assert_eq!(a.url(), b.url());
            }
        }
    }
}
