//! Configuration types consumed by the engine.
//!
//! The surrounding application owns parsing (file formats, watching,
//! admin APIs); this module only defines the deserializable shape handed
//! to [`Registry::apply_config`](crate::registry::Registry::apply_config)
//! and a validation pass that reports non-fatal warnings.
//!
//! All types support serde deserialization and provide defaults suitable
//! for a single-pool fleet.

use std::time::Duration;

use serde::Deserialize;

use crate::constants;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Root configuration: an ordered list of backend pools.
///
/// The first backend in the list is the default pool for proxied traffic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// A named pool of interchangeable servers.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Health-check path probed on every server of this pool.
    #[serde(default)]
    pub health_check: String,
    /// Selection attempts beyond the first when no server is eligible.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub sticky_sessions: bool,
    /// Seconds between health-check cycles.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Outbound request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerCfg,
    /// Fleet-size bounds. Not enforced here; honored opaquely for the
    /// scaling collaborator that owns enforcement.
    #[serde(default)]
    pub min_servers: u32,
    #[serde(default)]
    pub max_servers: u32,
}

/// One upstream endpoint inside a pool.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Per-server health endpoint overriding the pool's `health_check`.
    #[serde(default)]
    pub health_check_endpoint: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Per-pool circuit breaker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerCfg {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before probing recovery.
    #[serde(default = "default_recovery_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for CircuitBreakerCfg {
    fn default() -> Self {
        Self {
            failure_threshold: constants::BREAKER_FAILURE_THRESHOLD,
            recovery_timeout_secs: constants::BREAKER_RECOVERY_SECS,
            enabled: true,
        }
    }
}

impl BackendConfig {
    /// Outbound request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interval between health-check cycles as a [`Duration`].
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

impl Config {
    /// Validate the configuration, collecting non-fatal warnings.
    ///
    /// Empty rosters and zero weights are normal conditions for the engine
    /// (they map to `NoEligibleServer` or defaults at runtime), so they are
    /// reported as warnings rather than errors.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.backends.is_empty() {
            result
                .warnings
                .push("no backends configured; all requests will receive 503".to_string());
        }

        for backend in &self.backends {
            if backend.servers.is_empty() {
                result
                    .warnings
                    .push(format!("backend '{}' has no servers", backend.name));
            }
            for server in &backend.servers {
                if server.weight == 0 {
                    result.warnings.push(format!(
                        "server '{}' has weight 0; it will be treated as weight 1",
                        server.url
                    ));
                }
                if server.max_connections == 0 {
                    result.warnings.push(format!(
                        "server '{}' has max_connections 0 and can never be selected",
                        server.url
                    ));
                }
            }
            if backend.max_servers > 0 && backend.min_servers > backend.max_servers {
                result.warnings.push(format!(
                    "backend '{}': min_servers {} exceeds max_servers {}",
                    backend.name, backend.min_servers, backend.max_servers
                ));
            }
        }

        result
    }
}

fn default_retries() -> u32 {
    constants::DEFAULT_RETRIES
}

fn default_health_interval_secs() -> u64 {
    constants::HEALTH_CHECK_INTERVAL_SECS
}

fn default_timeout_ms() -> u64 {
    constants::DEFAULT_TIMEOUT_SECS * 1000
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    constants::DEFAULT_MAX_CONNECTIONS
}

fn default_active() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    constants::BREAKER_FAILURE_THRESHOLD
}

fn default_recovery_secs() -> u64 {
    constants::BREAKER_RECOVERY_SECS
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).expect("config should deserialize")
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse(
            r#"{
                "backends": [{
                    "name": "web",
                    "servers": [{"url": "http://127.0.0.1:9001"}]
                }]
            }"#,
        );

        let backend = &config.backends[0];
        assert_eq!(backend.retries, 3);
        assert!(!backend.sticky_sessions);
        assert_eq!(backend.timeout(), Duration::from_secs(30));
        assert_eq!(backend.health_interval(), Duration::from_secs(10));
        assert_eq!(backend.circuit_breaker.failure_threshold, 10);
        assert_eq!(backend.circuit_breaker.recovery_timeout_secs, 30);
        assert!(backend.circuit_breaker.enabled);

        let server = &backend.servers[0];
        assert_eq!(server.weight, 1);
        assert_eq!(server.max_connections, 1000);
        assert!(server.active);
        assert!(server.health_check_endpoint.is_none());
    }

    #[test]
    fn test_explicit_values_kept() {
        let config = parse(
            r#"{
                "backends": [{
                    "name": "api",
                    "servers": [
                        {"url": "http://127.0.0.1:9001", "weight": 5, "max_connections": 50}
                    ],
                    "health_check": "/healthz",
                    "retries": 1,
                    "sticky_sessions": true,
                    "timeout_ms": 2500,
                    "circuit_breaker": {"failure_threshold": 3, "recovery_timeout_secs": 5}
                }]
            }"#,
        );

        let backend = &config.backends[0];
        assert_eq!(backend.health_check, "/healthz");
        assert_eq!(backend.retries, 1);
        assert!(backend.sticky_sessions);
        assert_eq!(backend.timeout(), Duration::from_millis(2500));
        assert_eq!(backend.circuit_breaker.failure_threshold, 3);
        assert_eq!(backend.servers[0].weight, 5);
        assert_eq!(backend.servers[0].max_connections, 50);
    }

    #[test]
    fn test_validate_empty_config_warns() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.has_warnings());
        assert!(result.warnings[0].contains("no backends"));
    }

    #[test]
    fn test_validate_zero_weight_warns() {
        let config = parse(
            r#"{
                "backends": [{
                    "name": "web",
                    "servers": [{"url": "http://127.0.0.1:9001", "weight": 0}]
                }]
            }"#,
        );
        let result = config.validate();
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.contains("weight 0") && w.contains("127.0.0.1:9001"))
        );
    }

    #[test]
    fn test_validate_min_max_inversion_warns() {
        let config = parse(
            r#"{
                "backends": [{
                    "name": "web",
                    "servers": [{"url": "http://127.0.0.1:9001"}],
                    "min_servers": 5,
                    "max_servers": 2
                }]
            }"#,
        );
        let result = config.validate();
        assert!(result.warnings.iter().any(|w| w.contains("min_servers")));
    }
}
