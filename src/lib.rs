//! prow - adaptive HTTP reverse proxy and load-balancing engine.
//!
//! prow is the data-plane core of an operator-driven load balancer: for
//! each incoming HTTP request it chooses one of a mutable set of backend
//! servers, forwards the request, observes outcome and latency, and feeds
//! those observations back into per-server health models. It provides:
//!
//! - Six selection algorithms with an adaptive meta-controller
//! - Per-server circuit breakers, health classification and latency
//!   percentiles over a sample ring
//! - Hot reconfiguration: rosters mutate concurrently with serving, with
//!   graceful drain for removed servers
//! - Sticky sessions, transient-error retry and active health checks
//!
//! # Architecture
//!
//! ```text
//! [Client] -> [Proxy] -> [Selector] -> [Registry] -> [Backend servers]
//!                  \________ outcomes ____/
//! ```
//!
//! The [`registry::Registry`] owns all per-server state; the
//! [`balance::Selector`] picks servers under the algorithm chosen by the
//! [`balance::AdaptiveController`]; the [`proxy::Proxy`] terminates HTTP
//! and reports outcomes; the [`lifecycle::Lifecycle`] drains servers out of
//! the fleet without dropping in-flight traffic.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use prow::{balance::Selector, config::Config, proxy::Proxy, registry::Registry};
//!
//! let registry = Arc::new(Registry::new());
//! registry.apply_config(&config)?;
//!
//! let selector = Arc::new(Selector::new(registry.clone()));
//! let proxy = Arc::new(Proxy::new(registry, selector)?);
//! proxy.serve("0.0.0.0:8080".parse()?).await?;
//! ```

pub mod balance;
pub mod config;
pub mod constants;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod proxy;
pub mod registry;

pub use balance::{AdaptiveConfig, AdaptiveController, AlgorithmKind, Selector};
pub use config::{BackendConfig, CircuitBreakerCfg, Config, ServerConfig};
pub use error::{Error, Result};
pub use health::HealthChecker;
pub use lifecycle::{Lifecycle, LifecycleConfig};
pub use metrics::{MetricsSnapshot, TrafficStats};
pub use proxy::Proxy;
pub use registry::{
    BreakerState, HealthState, Registry, Server, ServerState, ServerStateView,
};
