//! HTTP reverse proxy service: the data plane.
//!
//! Terminates inbound HTTP/1.1, derives the client identity, drives
//! selection and retry, streams bytes to and from the chosen backend, and
//! reports every outcome back into the registry. It supports:
//!
//! - Sticky sessions (JSESSIONID cookie or X-Session-ID header) with a
//!   bounded binding store
//! - Selection retry with backoff when no server is eligible
//! - A single retry against a different server on transient transport
//!   errors (refused, timed out, unreachable)
//! - Fleet-wide traffic metrics feeding the adaptive controller

mod sticky;

pub use sticky::SessionStore;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{self, HeaderMap};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::balance::Selector;
use crate::constants;
use crate::error::Error;
use crate::metrics::{MetricsSnapshot, TrafficStats};
use crate::registry::{HealthState, PoolOptions, Registry, ServerState};

type ProxyBody = BoxBody<Bytes, std::io::Error>;

/// The reverse proxy: composes selection, forwarding and outcome recording.
pub struct Proxy {
    registry: Arc<Registry>,
    selector: Arc<Selector>,
    stats: Arc<TrafficStats>,
    sessions: SessionStore,
    client: reqwest::Client,
}

impl Proxy {
    /// Create a proxy over a registry and selector.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created (e.g. TLS
    /// configuration issues).
    pub fn new(registry: Arc<Registry>, selector: Arc<Selector>) -> Result<Self> {
        // Per-request timeouts come from each pool's configuration, so the
        // shared client only carries pooling settings. Redirects pass
        // through to the client untouched.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(constants::DEFAULT_MAX_CONNECTIONS as usize)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to create HTTP client - check TLS configuration")?;

        Ok(Self {
            registry,
            selector,
            stats: Arc::new(TrafficStats::new()),
            sessions: SessionStore::new(),
            client,
        })
    }

    /// Shared traffic counters.
    pub fn stats(&self) -> Arc<TrafficStats> {
        self.stats.clone()
    }

    /// Aggregate traffic metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.stats.snapshot()
    }

    /// Bind and serve until the task is cancelled.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.run(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener has no address")?;
        info!("proxy listening on http://{}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let proxy = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    async move { proxy.handle(req, remote_addr).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await
                    && !e.is_incomplete_message()
                {
                    debug!(error = %e, "connection error");
                }
            });
        }
    }

    /// Handle one request end to end.
    async fn handle(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let started = Instant::now();
        self.stats.request_started();

        let response = self.dispatch(req, remote_addr, started).await;

        let success = response.status().as_u16() < 500;
        self.stats.request_finished(started.elapsed(), success);
        self.feed_controller();

        Ok(response)
    }

    /// Report fleet metrics to the adaptive controller, attributed to the
    /// algorithm that was active while they accumulated.
    fn feed_controller(&self) {
        let view = self
            .registry
            .global_view(self.stats.requests_per_second());
        let controller = self.selector.controller();
        controller.observe(controller.active(), &view);
        controller.maybe_evaluate(&view);
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        started: Instant,
    ) -> Response<ProxyBody> {
        let Some(pool) = self.registry.default_pool() else {
            warn!("request received with no backends configured");
            return failure_response(&Error::NoBackends);
        };
        let options = self.registry.pool_options(&pool).unwrap_or_default();

        let client_identity = client_identity(req.headers(), remote_addr);
        let session = if options.sticky_sessions {
            session_id(req.headers())
        } else {
            None
        };

        let server = match self
            .resolve_server(&pool, &client_identity, session.as_deref(), &options)
            .await
        {
            Some(server) => server,
            None => {
                warn!(pool = %pool, "no eligible server after retries");
                return failure_response(&Error::NoEligibleServer);
            }
        };

        debug!(
            method = %req.method(),
            path = %req.uri().path(),
            server = %server.url(),
            client = %client_identity,
            "forwarding request"
        );

        // Buffer the request body once so a transient-error retry can
        // resend it.
        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                // Client went away mid-body; the selected server still gets
                // a failure outcome so its in-flight count is released.
                OutcomeGuard::new(self.registry.clone(), server.url().to_string(), started)
                    .complete(false);
                debug!(error = %e, "client aborted while sending body");
                return error_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let guard = OutcomeGuard::new(self.registry.clone(), server.url().to_string(), started);
        match self
            .forward(&parts, body_bytes.clone(), &server, &client_identity, options.timeout)
            .await
        {
            Ok(upstream) => {
                let status = upstream.status();
                guard.complete(status.as_u16() < 500);
                if status.as_u16() >= 500 {
                    warn!(server = %server.url(), status = %status, "upstream server error");
                }
                into_response(upstream)
            }
            Err(e) => {
                guard.complete(false);
                error!(server = %server.url(), error = %e, "upstream transport error");

                if is_transient(&e) {
                    return self
                        .retry_on_transient(
                            &pool,
                            &client_identity,
                            &parts,
                            body_bytes,
                            &server,
                            options.timeout,
                            started,
                        )
                        .await;
                }
                failure_response(&Error::transient(server.url(), &e))
            }
        }
    }

    /// Resolve a server: sticky binding first, then selection with retry.
    async fn resolve_server(
        &self,
        pool: &str,
        client_identity: &str,
        session: Option<&str>,
        options: &PoolOptions,
    ) -> Option<Arc<ServerState>> {
        if let Some(session_id) = session
            && let Some(url) = self.sessions.get(session_id)
        {
            if let Some(state) = self.registry.server(&url)
                && state.is_active()
                && state.health_state() == HealthState::Healthy
            {
                state.begin_request();
                return Some(state);
            }
            // Binding points at a server that left the roster or went
            // unhealthy; fall through to a fresh selection.
            self.sessions.unbind(session_id);
        }

        let server = self
            .select_with_retry(pool, client_identity, options.retries)
            .await?;
        if let Some(session_id) = session {
            self.sessions.bind(session_id, server.url());
        }
        Some(server)
    }

    async fn select_with_retry(
        &self,
        pool: &str,
        client_identity: &str,
        retries: u32,
    ) -> Option<Arc<ServerState>> {
        for attempt in 0..=retries {
            if let Some(server) = self.selector.select(pool, client_identity) {
                return Some(server);
            }
            if attempt < retries {
                tokio::time::sleep(Duration::from_millis(constants::RETRY_BACKOFF_MS)).await;
            }
        }
        None
    }

    /// One retry against a freshly selected, different server.
    #[allow(clippy::too_many_arguments)]
    async fn retry_on_transient(
        &self,
        pool: &str,
        client_identity: &str,
        parts: &hyper::http::request::Parts,
        body: Bytes,
        failed: &ServerState,
        timeout: Duration,
        started: Instant,
    ) -> Response<ProxyBody> {
        let exhausted = || failure_response(&Error::transient(failed.url(), "no retry target"));

        let Some(retry_server) = self.selector.select(pool, client_identity) else {
            return exhausted();
        };
        if retry_server.url() == failed.url() {
            // Selection came back to the failed server; undo the unused
            // selection and give up.
            retry_server.rollback_request();
            return exhausted();
        }

        info!(
            from = %failed.url(),
            to = %retry_server.url(),
            "retrying on transient upstream error"
        );

        let guard = OutcomeGuard::new(self.registry.clone(), retry_server.url().to_string(), started);
        match self
            .forward(parts, body, &retry_server, client_identity, timeout)
            .await
        {
            Ok(upstream) => {
                guard.complete(upstream.status().as_u16() < 500);
                into_response(upstream)
            }
            Err(e) => {
                guard.complete(false);
                error!(server = %retry_server.url(), error = %e, "retry failed");
                failure_response(&Error::transient(retry_server.url(), &e))
            }
        }
    }

    /// Send the buffered request to one backend.
    async fn forward(
        &self,
        parts: &hyper::http::request::Parts,
        body: Bytes,
        server: &ServerState,
        client_identity: &str,
        timeout: Duration,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", server.url().trim_end_matches('/'), path_and_query);

        let mut builder = self
            .client
            .request(parts.method.clone(), &target)
            .timeout(timeout);

        for (name, value) in &parts.headers {
            if is_hop_by_hop(name.as_str())
                || *name == header::HOST
                || *name == header::FORWARDED
                || name.as_str() == "x-forwarded-for"
            {
                continue;
            }
            builder = builder.header(name, value);
        }

        // Append ourselves to the forwarding chain.
        let forwarded_for = match parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {client_identity}"),
            None => client_identity.to_string(),
        };
        builder = builder.header("x-forwarded-for", forwarded_for);

        if !body.is_empty() {
            builder = builder.body(body);
        }

        builder.send().await
    }
}

/// Records exactly one outcome for a selected server, even when the
/// request future is dropped (client disconnect) or panics: the `Drop`
/// path records a failure for anything not explicitly completed.
struct OutcomeGuard {
    registry: Arc<Registry>,
    url: String,
    started: Instant,
    armed: bool,
}

impl OutcomeGuard {
    fn new(registry: Arc<Registry>, url: String, started: Instant) -> Self {
        Self {
            registry,
            url,
            started,
            armed: true,
        }
    }

    fn complete(mut self, success: bool) {
        self.armed = false;
        self.registry
            .record_outcome(&self.url, self.started.elapsed(), success);
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry
                .record_outcome(&self.url, self.started.elapsed(), false);
        }
    }
}

/// Derive the client identity: first X-Forwarded-For entry, then
/// X-Real-IP, then the remote socket host.
fn client_identity(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        && let Some(first) = xff.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    remote_addr.ip().to_string()
}

/// Extract a session identifier from the JSESSIONID cookie or the
/// X-Session-ID header.
fn session_id(headers: &HeaderMap) -> Option<String> {
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=')
                && name == "JSESSIONID"
                && !value.is_empty()
            {
                return Some(value.to_string());
            }
        }
    }
    headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Transport errors worth one retry against a different server:
/// connection refused / unreachable and timeouts.
fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

/// Check if a header is hop-by-hop and must not be forwarded.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn error_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(message))
        .unwrap()
}

/// Map an engine error to its HTTP response.
fn failure_response(error: &Error) -> Response<ProxyBody> {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    error_response(status, error.client_message())
}

/// Convert an upstream response, streaming its body through.
fn into_response(upstream: reqwest::Response) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(std::io::Error::other);
    match builder.body(StreamBody::new(stream).boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to assemble upstream response");
            error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderName, HeaderValue};

    fn remote() -> SocketAddr {
        "10.0.0.4:55012".parse().unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    // =========================================================================
    // Client identity precedence
    // =========================================================================

    #[test]
    fn test_identity_prefers_first_forwarded_for() {
        let headers = headers(&[
            ("x-forwarded-for", "10.0.0.1, 10.0.0.2"),
            ("x-real-ip", "10.0.0.3"),
        ]);
        assert_eq!(client_identity(&headers, remote()), "10.0.0.1");
    }

    #[test]
    fn test_identity_falls_back_to_real_ip() {
        let headers = headers(&[("x-real-ip", "10.0.0.3")]);
        assert_eq!(client_identity(&headers, remote()), "10.0.0.3");
    }

    #[test]
    fn test_identity_falls_back_to_remote_host() {
        assert_eq!(client_identity(&HeaderMap::new(), remote()), "10.0.0.4");
    }

    #[test]
    fn test_identity_ignores_empty_headers() {
        let headers = headers(&[("x-forwarded-for", " "), ("x-real-ip", "")]);
        assert_eq!(client_identity(&headers, remote()), "10.0.0.4");
    }

    // =========================================================================
    // Session extraction
    // =========================================================================

    #[test]
    fn test_session_from_cookie() {
        let headers = headers(&[("cookie", "theme=dark; JSESSIONID=abc123; lang=en")]);
        assert_eq!(session_id(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_session_from_header() {
        let headers = headers(&[("x-session-id", "xyz789")]);
        assert_eq!(session_id(&headers).as_deref(), Some("xyz789"));
    }

    #[test]
    fn test_cookie_takes_precedence_over_header() {
        let headers = headers(&[
            ("cookie", "JSESSIONID=from-cookie"),
            ("x-session-id", "from-header"),
        ]);
        assert_eq!(session_id(&headers).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn test_no_session() {
        assert!(session_id(&HeaderMap::new()).is_none());
        let headers = headers(&[("cookie", "theme=dark")]);
        assert!(session_id(&headers).is_none());
    }

    // =========================================================================
    // Header hygiene and error responses
    // =========================================================================

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-custom-header"));
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, "No active servers");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_failure_response_maps_error() {
        let response = failure_response(&Error::NoBackends);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"No backends available");

        let response = failure_response(&Error::NoEligibleServer);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"No active servers");
    }

    // =========================================================================
    // Transient error classification
    // =========================================================================

    #[tokio::test]
    async fn test_connect_error_is_transient() {
        // Bind and immediately drop a listener to get a closed port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let err = client
            .get(format!("http://{addr}/"))
            .timeout(Duration::from_millis(500))
            .send()
            .await
            .unwrap_err();
        assert!(is_transient(&err));
    }

    #[tokio::test]
    async fn test_timeout_error_is_transient() {
        // A listener that accepts but never responds.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _socket = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = reqwest::Client::new();
        let err = client
            .get(format!("http://{addr}/"))
            .timeout(Duration::from_millis(100))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(is_transient(&err));
    }
}
