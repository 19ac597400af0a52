//! End-to-end scenarios for the selection and resilience engine, driven
//! through the public API only.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use prow::balance::{AdaptiveConfig, AlgorithmKind, Selector};
use prow::config::Config;
use prow::lifecycle::{Lifecycle, LifecycleConfig};
use prow::registry::{BreakerState, GlobalView, Registry, Server};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Two healthy servers with weights 1 and 2: request counts converge to
/// the weight ratio, breakers stay closed, latency is tracked on both.
#[test]
fn weighted_distribution_over_healthy_fleet() {
    let registry = Arc::new(Registry::new());
    registry
        .upsert(&[
            Server::new("http://u1:80").with_weight(1),
            Server::new("http://u2:80").with_weight(2),
        ])
        .unwrap();
    let selector = Selector::new(registry.clone());

    let mut counts: HashMap<String, usize> = HashMap::new();
    for n in 0..300 {
        let chosen = selector
            .select("pool", &format!("10.0.{}.{}", n / 250, n % 250))
            .expect("healthy fleet always yields a server");
        *counts.entry(chosen.url().to_string()).or_default() += 1;
        registry.record_outcome(chosen.url(), ms(12), true);
    }

    let u1 = counts["http://u1:80"];
    let u2 = counts["http://u2:80"];
    assert!((90..=110).contains(&u1), "u1 got {u1} of 300");
    assert!((180..=220).contains(&u2), "u2 got {u2} of 300");

    for (_, view) in registry.snapshot_all() {
        assert!(!view.circuit_open);
        assert!(view.response_time > Duration::ZERO, "p95 not tracked");
        assert_eq!(view.current_conns, 0);
    }
}

/// Consecutive failures open the breaker and exclude the server; after the
/// recovery timeout a half-open probe is admitted and successes close it.
#[tokio::test]
async fn failure_burst_opens_breaker_and_recovers() {
    let registry = Arc::new(Registry::new());
    let config: Config = serde_json::from_str(
        r#"{"backends": [{
            "name": "pool",
            "servers": [{"url": "http://u1:80"}],
            "circuit_breaker": {"failure_threshold": 5, "recovery_timeout_secs": 1}
        }]}"#,
    )
    .unwrap();
    registry.apply_config(&config).unwrap();
    let selector = Selector::new(registry.clone());

    for n in 0..5 {
        let chosen = selector.select("pool", "10.0.0.1");
        assert!(chosen.is_some(), "selection {n} should succeed");
        registry.record_outcome("http://u1:80", ms(5), false);
    }
    assert_eq!(
        registry.server("http://u1:80").unwrap().breaker_state(),
        BreakerState::Open
    );

    // While open, selection returns none.
    assert!(selector.select("pool", "10.0.0.1").is_none());

    // Past the recovery timeout the probe is admitted (half-open) and five
    // consecutive successes close the circuit.
    tokio::time::sleep(ms(1100)).await;
    for _ in 0..5 {
        let chosen = selector.select("pool", "10.0.0.1");
        assert!(chosen.is_some(), "half-open probe should be admitted");
        registry.record_outcome("http://u1:80", ms(5), true);
    }
    let state = registry.server("http://u1:80").unwrap();
    assert_eq!(state.breaker_state(), BreakerState::Closed);
}

/// The controller switches only when the challenger clears the margin.
#[test]
fn algorithm_switch_respects_margin() {
    let registry = Arc::new(Registry::new());
    registry.upsert(&[Server::new("http://u1:80")]).unwrap();
    let selector = Selector::with_adaptive_config(
        registry,
        AdaptiveConfig {
            evaluation_window: ms(10),
            switch_threshold: 0.15,
        },
    );
    let controller = selector.controller();
    assert_eq!(controller.active(), AlgorithmKind::AdaptiveWeighted);

    let view_for = |error_rate: f64| GlobalView {
        error_rate,
        avg_response_time: ms(100),
        requests_per_second: 100.0,
        per_server_requests: vec![50, 50],
    };

    // Gap of 0.20 in error-rate score (0.66 * 0.30): switch.
    controller.observe(AlgorithmKind::AdaptiveWeighted, &view_for(0.70));
    controller.observe(AlgorithmKind::LeastResponseTime, &view_for(0.03));
    assert!(controller.maybe_evaluate(&view_for(0.70)));
    assert_eq!(controller.active(), AlgorithmKind::LeastResponseTime);

    // Gap of ~0.10: the active algorithm holds.
    std::thread::sleep(ms(15));
    controller.observe(AlgorithmKind::LeastResponseTime, &view_for(0.5));
    controller.observe(AlgorithmKind::PowerOfTwo, &view_for(0.17));
    assert!(!controller.maybe_evaluate(&view_for(0.5)));
    assert_eq!(controller.active(), AlgorithmKind::LeastResponseTime);
}

/// Graceful removal: immediate deactivation, in-flight requests complete,
/// callbacks fire once, then the server leaves the registry.
#[tokio::test]
async fn graceful_removal_waits_for_in_flight() {
    let registry = Arc::new(Registry::new());
    registry
        .upsert(&[Server::new("http://u1:80"), Server::new("http://u2:80")])
        .unwrap();
    let selector = Selector::new(registry.clone());
    let lifecycle = Arc::new(Lifecycle::with_config(
        registry.clone(),
        LifecycleConfig {
            drain_timeout: Duration::from_secs(10),
            check_interval: ms(20),
        },
    ));

    let drained = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    {
        let drained = drained.clone();
        let removed = removed.clone();
        lifecycle.set_callbacks(
            move |_| {
                drained.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                removed.fetch_add(1, Ordering::SeqCst);
            },
        );
    }

    // 50 requests pinned to u2.
    let u2 = registry.server("http://u2:80").unwrap();
    for _ in 0..50 {
        u2.begin_request();
    }

    assert!(lifecycle.start_graceful_removal("http://u2:80"));
    assert!(!u2.is_active());

    // New selections never return u2.
    for _ in 0..20 {
        let chosen = selector.select("pool", "10.0.0.1").unwrap();
        assert_eq!(chosen.url(), "http://u1:80");
        registry.record_outcome("http://u1:80", ms(1), true);
    }

    // The pinned requests complete normally against the draining server.
    for _ in 0..50 {
        registry.record_outcome("http://u2:80", ms(3), true);
    }
    let deadline = Instant::now() + Duration::from_secs(1);
    while lifecycle.is_draining("http://u2:80") && Instant::now() < deadline {
        tokio::time::sleep(ms(10)).await;
    }

    assert_eq!(drained.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert!(registry.server("http://u2:80").is_none());
}

/// Roster mutation concurrent with selection never yields a removed server
/// and never panics.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upsert_and_selection() {
    let registry = Arc::new(Registry::new());
    registry
        .upsert(&[Server::new("http://u1:80"), Server::new("http://u2:80")])
        .unwrap();
    let selector = Arc::new(Selector::new(registry.clone()));

    let select_task = {
        let selector = selector.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            for n in 0..2000 {
                if let Some(chosen) = selector.select("pool", &format!("c{n}")) {
                    registry.record_outcome(chosen.url(), ms(1), true);
                }
                if n % 256 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let mutate_task = {
        let registry = registry.clone();
        tokio::spawn(async move {
            for round in 0..50 {
                let mut roster = vec![Server::new("http://u1:80")];
                if round % 2 == 0 {
                    roster.push(Server::new("http://u2:80"));
                }
                roster.push(Server::new(format!("http://u{}:80", 3 + round % 3)));
                registry.upsert(&roster).unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    select_task.await.unwrap();
    mutate_task.await.unwrap();

    // The final roster is whatever the last upsert published.
    assert!(registry.server("http://u1:80").is_some());
}
