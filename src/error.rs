//! Typed errors for the data plane.
//!
//! This module provides structured errors for selection and forwarding,
//! enabling precise HTTP status mapping and retry decisions. Nothing in the
//! data path panics on malformed input: missing headers, zero weights and
//! empty rosters all map to a variant here or to a default value.

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Selection exhausted its retries without finding an eligible server.
    #[error("no active servers")]
    NoEligibleServer,

    /// No backend pool is configured at all.
    #[error("no backends available")]
    NoBackends,

    /// Transport-level failure talking to an upstream (refused, timed out,
    /// unreachable). Eligible for a single retry against a different server.
    #[error("transient upstream failure for '{url}': {reason}")]
    TransientUpstream { url: String, reason: String },

    /// Upstream answered with a server error; the status passes through.
    #[error("upstream returned status {status}")]
    UpstreamError { status: u16 },

    /// The server's circuit is open. Never surfaced to clients; it only
    /// excludes the server from the eligible set until its retry time.
    #[error("circuit open for '{url}'")]
    CircuitOpen { url: String },

    /// A reconfiguration was rejected before touching live state.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// HTTP plumbing error (malformed response assembly and the like).
    #[error("HTTP error: {0}")]
    Http(String),
}

impl Error {
    /// HTTP status code this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NoEligibleServer
            | Self::NoBackends
            | Self::TransientUpstream { .. }
            | Self::CircuitOpen { .. } => 503,
            Self::UpstreamError { status } => *status,
            Self::Configuration(_) | Self::Http(_) => 500,
        }
    }

    /// Canonical client-facing body for errors that surface as HTTP
    /// responses. Part of the wire contract, hence the fixed wording.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::NoEligibleServer => "No active servers",
            Self::NoBackends => "No backends available",
            Self::TransientUpstream { .. } | Self::CircuitOpen { .. } => {
                "Service Temporarily Unavailable"
            }
            Self::UpstreamError { .. } => "Upstream Error",
            Self::Configuration(_) | Self::Http(_) => "Internal Error",
        }
    }

    /// Create a transient-upstream error from a transport failure.
    pub fn transient(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TransientUpstream {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
