//! Process-wide traffic metrics.
//!
//! Counters are monotonic atomics; requests-per-second is derived from the
//! counter delta across a measured wall-clock window and cached between
//! window boundaries, so concurrent observers all read a coherent rate and
//! nothing is ever reset on read.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Point-in-time aggregate of proxy traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_per_second: f64,
    pub total_requests: u64,
    pub active_connections: i64,
    pub avg_response_time: Duration,
    pub error_rate: f64,
    /// Successful responses per second over the sampling window.
    pub throughput: f64,
}

#[derive(Debug)]
struct RateWindow {
    sampled_at: Instant,
    total: u64,
    successes: u64,
    requests_per_second: f64,
    throughput: f64,
}

/// Shared traffic counters updated on every proxied request.
#[derive(Debug)]
pub struct TrafficStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_connections: AtomicI64,
    total_latency_us: AtomicU64,
    min_sample_interval: Duration,
    rate: Mutex<RateWindow>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::with_sample_interval(Duration::from_secs(1))
    }

    /// Create stats with a custom minimum rate-sampling window.
    pub fn with_sample_interval(min_sample_interval: Duration) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            total_latency_us: AtomicU64::new(0),
            min_sample_interval,
            rate: Mutex::new(RateWindow {
                sampled_at: Instant::now(),
                total: 0,
                successes: 0,
                requests_per_second: 0.0,
                throughput: 0.0,
            }),
        }
    }

    /// Count a request entering the proxy.
    pub fn request_started(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a request leaving the proxy. Pairs with [`Self::request_started`].
    pub fn request_finished(&self, duration: Duration, success: bool) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
        self.total_latency_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Requests per second over the most recent sampling window.
    pub fn requests_per_second(&self) -> f64 {
        self.sample_rates().0
    }

    /// Aggregate view of traffic since startup plus windowed rates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successes = self.successful_requests.load(Ordering::Relaxed);
        let failures = self.failed_requests.load(Ordering::Relaxed);
        let latency_us = self.total_latency_us.load(Ordering::Relaxed);
        let (requests_per_second, throughput) = self.sample_rates();

        let finished = successes + failures;
        MetricsSnapshot {
            requests_per_second,
            total_requests: total,
            active_connections: self.active_connections(),
            avg_response_time: if finished > 0 {
                Duration::from_micros(latency_us / finished)
            } else {
                Duration::ZERO
            },
            error_rate: if finished > 0 {
                failures as f64 / finished as f64
            } else {
                0.0
            },
            throughput,
        }
    }

    /// Advance the rate window if it has run long enough, and return the
    /// cached rates otherwise. Observers never interfere with each other:
    /// within one window everyone reads the same figures.
    fn sample_rates(&self) -> (f64, f64) {
        let now = Instant::now();
        let total = self.total_requests.load(Ordering::Relaxed);
        let successes = self.successful_requests.load(Ordering::Relaxed);

        let mut window = self.rate.lock();
        let elapsed = now.duration_since(window.sampled_at);
        if elapsed >= self.min_sample_interval {
            let secs = elapsed.as_secs_f64();
            window.requests_per_second = (total - window.total) as f64 / secs;
            window.throughput = (successes - window.successes) as f64 / secs;
            window.sampled_at = now;
            window.total = total;
            window.successes = successes;
        }
        (window.requests_per_second, window.throughput)
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}
