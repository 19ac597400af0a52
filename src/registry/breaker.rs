//! Per-server circuit breaker.
//!
//! Three-state finite automaton that sheds load after a failure burst and
//! probes recovery:
//!
//! - **Closed**: normal operation, requests allowed
//! - **Open**: too many failures, requests rejected until the retry time
//! - **`HalfOpen`**: probing recovery; closes again after enough successes
//!
//! One breaker is owned by each [`ServerState`](super::ServerState) and is
//! mutated under that server's state lock, so transitions are totally
//! ordered per server: observers may miss intermediate states but never see
//! a regression.

use std::time::{Duration, Instant};

use crate::config::CircuitBreakerCfg;
use crate::constants;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests allowed.
    Closed,
    /// Requests rejected until the recovery timeout elapses.
    Open,
    /// Testing recovery; closes after enough consecutive successes.
    HalfOpen,
}

/// Breaker tunables, normally taken from a pool's [`CircuitBreakerCfg`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before half-open probing.
    pub recovery_timeout: Duration,
    /// A disabled breaker stays permanently closed.
    pub enabled: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: constants::BREAKER_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(constants::BREAKER_RECOVERY_SECS),
            enabled: true,
        }
    }
}

impl From<&CircuitBreakerCfg> for BreakerConfig {
    fn from(cfg: &CircuitBreakerCfg) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(cfg.recovery_timeout_secs),
            enabled: cfg.enabled,
        }
    }
}

/// Per-server three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u64,
    success_count: u64,
    last_failure: Option<Instant>,
    next_retry: Option<Instant>,
    half_open_successes: u32,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a closed breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            next_retry: None,
            half_open_successes: 0,
            config,
        }
    }

    /// Whether a request may be sent through this breaker at `now`.
    ///
    /// An open circuit past its retry time transitions to `HalfOpen` here
    /// (resetting the probe success counter) and admits the request.
    pub fn allows(&mut self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.next_retry.is_some_and(|t| now >= t) {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful outcome.
    ///
    /// In `HalfOpen`, enough consecutive successes close the circuit and
    /// reset the failure count to zero.
    pub fn on_success(&mut self) {
        self.success_count += 1;
        if self.state == BreakerState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= constants::BREAKER_HALF_OPEN_SUCCESSES {
                self.state = BreakerState::Closed;
                self.failure_count = 0;
                self.half_open_successes = 0;
            }
        }
    }

    /// Record a failed outcome.
    ///
    /// Any failure while half-open reopens the circuit immediately; in
    /// `Closed`, reaching the threshold opens it and schedules the retry.
    pub fn on_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        if !self.config.enabled {
            return;
        }
        match self.state {
            BreakerState::HalfOpen => self.trip(now),
            BreakerState::Closed => {
                if self.failure_count >= u64::from(self.config.failure_threshold) {
                    self.trip(now);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.next_retry = Some(now + self.config.recovery_timeout);
        self.half_open_successes = 0;
    }

    /// Current state without considering the retry time.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// True if the circuit is in `Open` state.
    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    /// Accumulated failure count since the last close.
    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    /// Accumulated success count.
    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    /// When the open circuit will next admit a probe, if open.
    pub fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }

    /// Instant of the most recent failure.
    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            enabled: true,
        })
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let mut cb = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allows(Instant::now()));
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let mut cb = breaker(3, Duration::from_secs(30));
        let now = Instant::now();

        cb.on_failure(now);
        cb.on_failure(now);
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.on_failure(now);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allows(now));
        assert!(cb.next_retry().is_some());
    }

    #[test]
    fn test_open_rejects_until_recovery_elapses() {
        let mut cb = breaker(1, Duration::from_millis(50));
        let now = Instant::now();
        cb.on_failure(now);

        assert!(!cb.allows(now));
        assert!(!cb.allows(now + Duration::from_millis(49)));

        // Past the retry time the circuit half-opens and admits a probe.
        assert!(cb.allows(now + Duration::from_millis(50)));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_five_successes() {
        let mut cb = breaker(1, Duration::from_millis(10));
        let now = Instant::now();
        cb.on_failure(now);
        assert!(cb.allows(now + Duration::from_millis(10)));

        for _ in 0..4 {
            cb.on_success();
            assert_eq!(cb.state(), BreakerState::HalfOpen);
        }
        cb.on_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker(2, Duration::from_millis(10));
        let now = Instant::now();
        cb.on_failure(now);
        cb.on_failure(now);
        assert!(cb.allows(now + Duration::from_millis(10)));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.on_failure(now + Duration::from_millis(11));
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allows(now + Duration::from_millis(12)));
    }

    #[test]
    fn test_half_open_success_counter_resets_on_reopen() {
        let mut cb = breaker(1, Duration::from_millis(10));
        let now = Instant::now();
        cb.on_failure(now);
        assert!(cb.allows(now + Duration::from_millis(10)));

        // Three probe successes, then a failure reopens.
        cb.on_success();
        cb.on_success();
        cb.on_success();
        cb.on_failure(now + Duration::from_millis(20));
        assert_eq!(cb.state(), BreakerState::Open);

        // After the next half-open transition, five fresh successes are needed.
        assert!(cb.allows(now + Duration::from_millis(30)));
        for _ in 0..4 {
            cb.on_success();
        }
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_disabled_breaker_never_opens() {
        let mut cb = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            enabled: false,
        });
        let now = Instant::now();
        for _ in 0..20 {
            cb.on_failure(now);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allows(now));
        // Failures are still counted for observability.
        assert_eq!(cb.failure_count(), 20);
    }

    #[test]
    fn test_config_from_pool_settings() {
        let cfg = CircuitBreakerCfg {
            failure_threshold: 0,
            recovery_timeout_secs: 7,
            enabled: true,
        };
        let config = BreakerConfig::from(&cfg);
        // A zero threshold would open on creation; it's clamped to 1.
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.recovery_timeout, Duration::from_secs(7));
    }
}
