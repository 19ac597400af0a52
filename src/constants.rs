//! Default tunables shared across the engine.
//!
//! Values here are the defaults applied when a backend's configuration
//! leaves the corresponding knob unset. They are deliberately conservative:
//! a fleet that never touches them gets a breaker that sheds load after a
//! sustained failure burst and drains removed servers for half a minute.

/// Capacity of the per-server latency sample ring.
pub const LATENCY_RING_CAPACITY: usize = 1000;

/// Consecutive failures before a server's circuit opens.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 10;

/// Seconds an open circuit waits before allowing half-open probes.
pub const BREAKER_RECOVERY_SECS: u64 = 30;

/// Half-open successes required to close the circuit again.
pub const BREAKER_HALF_OPEN_SUCCESSES: u32 = 5;

/// Consecutive request failures before a server is classified Degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Consecutive request failures before a server is classified Unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 10;

/// Seconds an Unhealthy server stays out of the eligible set after being
/// marked. Past this window it gets another chance at traffic.
pub const UNHEALTHY_QUARANTINE_SECS: u64 = 10;

/// Default selection retries when a backend doesn't configure its own.
pub const DEFAULT_RETRIES: u32 = 3;

/// Pause between failed selection attempts.
pub const RETRY_BACKOFF_MS: u64 = 100;

/// Default per-server concurrent connection cap.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1000;

/// Default outbound request timeout when a backend doesn't configure one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Seconds between effective-weight refreshes in the adaptive scheduler.
pub const WEIGHT_REFRESH_SECS: u64 = 5;

/// Floor for effective weights so no server is starved entirely.
pub const EFFECTIVE_WEIGHT_FLOOR: f64 = 0.1;

/// Latency baseline used by weight and score computations.
pub const RESPONSE_BASELINE_MS: u64 = 100;

/// Optimistic response-time assumption for servers with no samples yet.
pub const DEFAULT_RESPONSE_ESTIMATE_MS: u64 = 50;

/// Virtual nodes per server on the consistent-hash ring.
pub const VIRTUAL_NODES_PER_SERVER: usize = 150;

/// Virtual-time level at which the fair-queue scheduler renormalises.
pub const FAIR_QUEUE_NORMALIZE_THRESHOLD: f64 = 1000.0;

/// Seconds between algorithm score evaluations.
pub const EVALUATION_WINDOW_SECS: u64 = 30;

/// Score margin a candidate algorithm must exceed the active one by.
pub const SWITCH_THRESHOLD: f64 = 0.15;

/// Seconds a draining server may hold in-flight requests before forced removal.
pub const DRAIN_TIMEOUT_SECS: u64 = 30;

/// Seconds between in-flight checks while draining.
pub const DRAIN_CHECK_INTERVAL_SECS: u64 = 1;

/// Per-probe timeout for active health checks.
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default interval between health-check cycles.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

/// Maximum sticky-session bindings kept in memory.
pub const SESSION_CACHE_CAPACITY: u64 = 10_000;

/// Idle time after which a sticky-session binding is evicted.
pub const SESSION_IDLE_SECS: u64 = 1800;
