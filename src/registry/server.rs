//! Per-server state: identity, health, counters, latency metrics, weights.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::ServerConfig;
use crate::constants;

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use super::ring::RingBuffer;

/// Health classification derived from observed request outcomes and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Serving normally.
    Healthy,
    /// Accumulating failures; still selectable at reduced weight.
    Degraded,
    /// Failing persistently; quarantined from selection for a window.
    Unhealthy,
    /// A probe succeeded after unhealthiness; traffic completes recovery.
    Recovering,
}

/// A backend endpoint as configured. The URL is its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub url: String,
    pub weight: u32,
    pub max_connections: u32,
    pub active: bool,
    pub health_check_endpoint: Option<String>,
}

impl Server {
    /// Build a server with default weight and connection cap.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: 1,
            max_connections: constants::DEFAULT_MAX_CONNECTIONS,
            active: true,
            health_check_endpoint: None,
        }
    }

    /// Same server with a different configured weight.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Same server with a different connection cap.
    #[must_use]
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

impl From<&ServerConfig> for Server {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            weight: cfg.weight,
            max_connections: cfg.max_connections,
            active: cfg.active,
            health_check_endpoint: cfg.health_check_endpoint.clone(),
        }
    }
}

/// Weight accumulators for the smoothed weighted round-robin scheme.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingWeights {
    /// Computed weight after performance factors are applied.
    pub effective: f64,
    /// Running accumulator; the scheduler's only mutable state per server.
    pub current: f64,
}

/// Derived metrics recomputed on each recorded outcome.
#[derive(Debug, Clone, Copy)]
pub struct DerivedMetrics {
    pub p95: Duration,
    pub p99: Duration,
    pub error_rate: f64,
    pub throughput_rps: f64,
    pub last_update: Option<Instant>,
}

impl Default for DerivedMetrics {
    fn default() -> Self {
        Self {
            p95: Duration::ZERO,
            p99: Duration::ZERO,
            error_rate: 0.0,
            throughput_rps: 0.0,
            last_update: None,
        }
    }
}

#[derive(Debug)]
struct HealthMeta {
    state: HealthState,
    consecutive_failures: u32,
    /// Stamped when the server transitions to Unhealthy; drives the
    /// quarantine window in eligibility checks.
    marked_unhealthy_at: Option<Instant>,
    last_health_check: Option<Instant>,
}

/// Read-only snapshot of one server's counters and state.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStateView {
    pub url: String,
    pub weight: u32,
    pub active: bool,
    /// True iff the health classification is `Healthy`.
    pub healthy: bool,
    /// True iff the circuit is in `Open` state.
    pub circuit_open: bool,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub current_conns: i64,
    /// p95 response time over the sample window.
    pub response_time: Duration,
}

/// Authoritative in-memory record for one server.
///
/// Hot-path counters are atomics readable without any lock; the breaker and
/// health classification sit behind small mutexes so their transitions are
/// totally ordered per server. The latency ring carries its own lock.
#[derive(Debug)]
pub struct ServerState {
    url: String,
    weight: AtomicU32,
    max_connections: AtomicU32,
    active: AtomicBool,
    health_endpoint: RwLock<Option<String>>,

    active_conns: AtomicI64,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_us: AtomicU64,

    latencies: RingBuffer,
    derived: Mutex<DerivedMetrics>,
    health: Mutex<HealthMeta>,
    breaker: Mutex<CircuitBreaker>,
    scheduling: Mutex<SchedulingWeights>,
    created_at: Instant,
}

impl ServerState {
    /// Create state for a newly rostered server.
    pub fn new(server: &Server, breaker_config: BreakerConfig) -> Self {
        let weight = server.weight.max(1);
        Self {
            url: server.url.clone(),
            weight: AtomicU32::new(weight),
            max_connections: AtomicU32::new(server.max_connections),
            active: AtomicBool::new(server.active),
            health_endpoint: RwLock::new(server.health_check_endpoint.clone()),
            active_conns: AtomicI64::new(0),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            latencies: RingBuffer::new(constants::LATENCY_RING_CAPACITY),
            derived: Mutex::new(DerivedMetrics::default()),
            health: Mutex::new(HealthMeta {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                marked_unhealthy_at: None,
                last_health_check: None,
            }),
            breaker: Mutex::new(CircuitBreaker::new(breaker_config)),
            scheduling: Mutex::new(SchedulingWeights {
                effective: f64::from(weight),
                current: 0.0,
            }),
            created_at: Instant::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Apply a configured weight change; the effective weight restarts from
    /// the new base and gets re-derated on the next refresh.
    pub fn set_weight(&self, weight: u32) {
        let weight = weight.max(1);
        self.weight.store(weight, Ordering::Relaxed);
        self.scheduling.lock().effective = f64::from(weight);
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.load(Ordering::Relaxed)
    }

    pub fn set_max_connections(&self, max: u32) {
        self.max_connections.store(max, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip the active flag. An inactive server receives no new selections
    /// but keeps recording outcomes for requests already in flight.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn health_endpoint(&self) -> Option<String> {
        self.health_endpoint.read().clone()
    }

    pub fn set_health_endpoint(&self, endpoint: Option<String>) {
        *self.health_endpoint.write() = endpoint;
    }

    /// Account a selection: bumps the request counter and the in-flight
    /// connection count. Paired with the decrement in [`Self::observe`].
    pub fn begin_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo a [`Self::begin_request`] for a selection that was never used
    /// (e.g. a retry that resolved to the failed server). Keeps the
    /// in-flight gauge honest without fabricating an outcome.
    pub fn rollback_request(&self) {
        self.requests.fetch_sub(1, Ordering::Relaxed);
        self.active_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Sum of all observed latencies.
    pub fn total_latency(&self) -> Duration {
        Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed))
    }

    pub fn health_state(&self) -> HealthState {
        self.health.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health.lock().consecutive_failures
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.health.lock().last_health_check
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().state()
    }

    pub(crate) fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock()
    }

    pub(crate) fn scheduling(&self) -> MutexGuard<'_, SchedulingWeights> {
        self.scheduling.lock()
    }

    /// Current effective weight, floored so scores never divide by zero.
    pub fn effective_weight(&self) -> f64 {
        self.scheduling
            .lock()
            .effective
            .max(constants::EFFECTIVE_WEIGHT_FLOOR)
    }

    /// Derived metrics as of the last recorded outcome.
    pub fn derived_metrics(&self) -> DerivedMetrics {
        *self.derived.lock()
    }

    /// All latency samples, oldest first.
    pub fn latency_samples(&self) -> Vec<Duration> {
        self.latencies.ordered()
    }

    /// Whether this server may receive a new selection at `now`.
    ///
    /// Eligible iff: active, below its connection cap, circuit not open
    /// (or open but past the retry time, which half-opens it here), and not
    /// marked Unhealthy within the quarantine window.
    pub fn is_eligible(&self, now: Instant) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.active_connections() >= i64::from(self.max_connections()) {
            return false;
        }
        if !self.breaker.lock().allows(now) {
            return false;
        }
        let health = self.health.lock();
        if health.state == HealthState::Unhealthy
            && health.marked_unhealthy_at.is_some_and(|t| {
                now.duration_since(t)
                    < Duration::from_secs(constants::UNHEALTHY_QUARANTINE_SECS)
            })
        {
            return false;
        }
        true
    }

    /// Record the outcome of a finished request.
    ///
    /// Always decrements the in-flight count (pairing the increment from
    /// [`Self::begin_request`]), feeds the latency ring, advances the
    /// breaker and health automata, and recomputes derived metrics.
    pub fn observe(&self, duration: Duration, success: bool, now: Instant) {
        self.latencies.push(duration);
        self.total_latency_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.active_conns.fetch_sub(1, Ordering::AcqRel);

        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            self.breaker.lock().on_success();
            let mut health = self.health.lock();
            health.consecutive_failures = 0;
            if matches!(health.state, HealthState::Degraded | HealthState::Recovering) {
                health.state = HealthState::Healthy;
            }
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.breaker.lock().on_failure(now);
            let mut health = self.health.lock();
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            if health.consecutive_failures >= constants::UNHEALTHY_AFTER_FAILURES {
                if health.state != HealthState::Unhealthy {
                    health.marked_unhealthy_at = Some(now);
                }
                health.state = HealthState::Unhealthy;
            } else if health.consecutive_failures >= constants::DEGRADED_AFTER_FAILURES
                && health.state == HealthState::Healthy
            {
                health.state = HealthState::Degraded;
            }
        }

        self.recompute_derived(now);
    }

    /// Record an active health-probe result.
    ///
    /// A successful probe moves an Unhealthy server to Recovering so that
    /// real traffic can complete the transition back to Healthy. A failed
    /// probe marks the server Unhealthy immediately.
    pub fn observe_probe(&self, healthy: bool, now: Instant) {
        let mut health = self.health.lock();
        health.last_health_check = Some(now);
        if healthy {
            if health.state == HealthState::Unhealthy {
                health.state = HealthState::Recovering;
            }
        } else {
            if health.state != HealthState::Unhealthy {
                health.marked_unhealthy_at = Some(now);
            }
            health.state = HealthState::Unhealthy;
        }
    }

    fn recompute_derived(&self, now: Instant) {
        let total = self.requests.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);

        let mut samples = self.latencies.ordered();
        samples.sort_unstable();

        let mut derived = self.derived.lock();
        derived.error_rate = if total > 0 {
            failures as f64 / total as f64
        } else {
            0.0
        };
        if !samples.is_empty() {
            let p95_index = (samples.len() as f64 * 0.95) as usize;
            let p99_index = (samples.len() as f64 * 0.99) as usize;
            if p95_index < samples.len() {
                derived.p95 = samples[p95_index];
            }
            if p99_index < samples.len() {
                derived.p99 = samples[p99_index];
            }
        }
        let uptime = now.duration_since(self.created_at).as_secs_f64();
        if uptime > 0.0 {
            derived.throughput_rps = total as f64 / uptime;
        }
        derived.last_update = Some(now);
    }

    /// Read-only view of the current state. No torn reads: each field is a
    /// single atomic load or taken under its own short lock.
    pub fn view(&self) -> ServerStateView {
        ServerStateView {
            url: self.url.clone(),
            weight: self.weight(),
            active: self.is_active(),
            healthy: self.health_state() == HealthState::Healthy,
            circuit_open: self.breaker_state() == BreakerState::Open,
            total_requests: self.total_requests(),
            failed_requests: self.failure_count(),
            current_conns: self.active_connections(),
            response_time: self.derived_metrics().p95,
        }
    }
}
