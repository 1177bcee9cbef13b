//! The proxy pipeline — §4.6, §5.
//!
//! Grounded on original_source's `internal/handler/proxy.go`'s
//! `ProxyHandler`, re-expressed as a single async function over an explicit
//! [`context::RequestContext`] (§9's design note) instead of a
//! dynamically-typed request context and an overridden `ResponseWriter`.
//! Headers-once falls out structurally: axum's handler model returns exactly
//! one [`Response`] per call, so there is no writer to race.

pub mod context;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::balancer::{Backend, Balancer};
use crate::identity::ClientIdentifier;
use crate::ratelimit::RateLimiter;
use context::{RequestContext, RequestId};

/// Response-header timeout ceiling (§4.6c). `reqwest` has no first-class
/// "time to first header byte" knob, so this bounds the whole attempt
/// instead — documented as a deliberate approximation in DESIGN.md.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Domain error kinds from §7, used for structured log messages. The
/// pipeline never returns these to a caller — every branch resolves
/// directly to a terminal [`Response`] — but naming them keeps log lines
/// consistent with the admin-facing [`crate::error::AdminError`] kinds.
#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("concurrency slot unavailable")]
    Overloaded,
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),
    #[error("request deadline elapsed")]
    Deadline,
    #[error("no backend available")]
    NoBackend,
}

/// Owns every piece of shared state a request needs and exposes the single
/// entry point axum dispatches unmatched routes to.
pub struct ProxyPipeline {
    balancer: Arc<Balancer>,
    rate_limiter: Arc<RateLimiter>,
    identifier: ClientIdentifier,
    http_client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    max_body_bytes: usize,
    request_timeout: Duration,
}

impl ProxyPipeline {
    pub fn new(
        balancer: Arc<Balancer>,
        rate_limiter: Arc<RateLimiter>,
        identifier: ClientIdentifier,
        concurrency_limit: usize,
        max_body_bytes: usize,
        request_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Arc::new(Self {
            balancer,
            rate_limiter,
            identifier,
            http_client,
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            max_body_bytes,
            request_timeout,
        }))
    }

    /// Fallback handler mounted on every path not under `/api/ratelimit`.
    pub async fn handle(
        State(pipeline): State<Arc<Self>>,
        ConnectInfo(peer): ConnectInfo<SocketAddr>,
        req: axum::extract::Request,
    ) -> Response {
        pipeline.run(req, peer).await
    }

    async fn run(&self, req: axum::extract::Request, peer: SocketAddr) -> Response {
        let unix_nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let request_id = RequestId::new(unix_nanos, peer);

        let (parts, body) = req.into_parts();
        let client_id = self.identifier.identify(&parts.headers, &parts.uri, peer.ip());

        // §4.6 step 3: rate-limit check precedes admission; no slot is touched.
        if !self.rate_limiter.is_allowed(&client_id) {
            info!(request_id = %request_id, client_id = %client_id, error = %ProxyError::RateLimited, "rejected");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"error":"Rate limit exceeded"}"#,
            )
                .into_response();
        }

        // §4.6 step 4: attach the default deadline (always — the ingress
        // request carries none in this design).
        let deadline = Instant::now() + self.request_timeout;

        // §4.6 step 5: non-blocking admission. The permit is owned and
        // dropped on every exit path below, RAII-releasing the slot exactly
        // once regardless of which branch returns (§9 open question 3).
        let _permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(request_id = %request_id, client_id = %client_id, error = %ProxyError::Overloaded, "rejected");
                return (StatusCode::SERVICE_UNAVAILABLE, "Server is overloaded").into_response();
            }
        };

        // §4.6 step 6: capture the body once, bounded by max_body_bytes.
        let captured_body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(bytes),
            Err(_) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
            }
        };

        // §9 open question 4: captured at request start, not handler construction.
        let max_retries = self.balancer.len() as u32;
        let mut ctx = RequestContext::new(request_id, client_id, max_retries, captured_body, deadline);

        if max_retries == 0 {
            warn!(request_id = %ctx.request_id, error = %ProxyError::NoBackend, "rejected");
            return (StatusCode::BAD_GATEWAY, "All backend servers failed to process the request").into_response();
        }

        self.attempt_loop(&mut ctx, &parts.method, &parts.uri, &parts.headers).await
    }

    async fn attempt_loop(
        &self,
        ctx: &mut RequestContext,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Response {
        loop {
            let Some(target) = self.balancer.next() else {
                warn!(request_id = %ctx.request_id, "no backend available mid-request");
                return (StatusCode::BAD_GATEWAY, "All backend servers failed to process the request").into_response();
            };
            ctx.chosen_backend = Some(target.clone());

            if ctx.retry_count > 0 {
                info!(request_id = %ctx.request_id, attempt = ctx.retry_count, %target, "retrying request");
            }

            match self.dispatch(ctx, method, uri, headers, &target).await {
                Ok(response) if response.status().as_u16() < 500 => {
                    info!(
                        request_id = %ctx.request_id,
                        client_id = %ctx.client_id,
                        attempt = ctx.retry_count,
                        backend = %target,
                        status = response.status().as_u16(),
                        duration_ms = ctx.elapsed_ms(),
                        "request succeeded"
                    );
                    return response;
                }
                Ok(response) => {
                    let error = ProxyError::TransientUpstream(format!("status {}", response.status()));
                    warn!(request_id = %ctx.request_id, attempt = ctx.retry_count, backend = %target, %error, "attempt failed");
                    if let Some(terminal) = self.fail_attempt(ctx, &target, false) {
                        return terminal;
                    }
                }
                Err(deadline_elapsed) => {
                    let error =
                        if deadline_elapsed { ProxyError::Deadline } else { ProxyError::TransientUpstream("transport error".into()) };
                    warn!(request_id = %ctx.request_id, attempt = ctx.retry_count, backend = %target, %error, "attempt failed");
                    if let Some(terminal) = self.fail_attempt(ctx, &target, deadline_elapsed) {
                        return terminal;
                    }
                }
            }
        }
    }

    /// Records a failed attempt and either advances `retry_count` (returning
    /// `None` so the loop retries) or resolves the terminal response.
    fn fail_attempt(&self, ctx: &mut RequestContext, target: &Backend, deadline_elapsed: bool) -> Option<Response> {
        if !ctx.is_final_attempt() {
            ctx.retry_count += 1;
            return None;
        }

        warn!(
            request_id = %ctx.request_id,
            client_id = %ctx.client_id,
            attempt = ctx.retry_count,
            backend = %target,
            duration_ms = ctx.elapsed_ms(),
            deadline_elapsed,
            "all backend attempts failed"
        );

        Some(if deadline_elapsed {
            (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout").into_response()
        } else {
            (StatusCode::BAD_GATEWAY, "All backend servers failed to process the request").into_response()
        })
    }

    /// `true` in the `Err` case means the context deadline elapsed; `false`
    /// means a transport error occurred before the deadline.
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        target: &Backend,
    ) -> Result<Response, bool> {
        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(true);
        }
        // §4.6c's response-header timeout bounds time-to-first-header only,
        // not the whole request — a backend streaming a large body past this
        // ceiling is not a failed attempt. `send()` resolves once the status
        // line and headers are in, before the body is read, so wrapping it
        // (instead of passing this as `RequestBuilder::timeout`) leaves body
        // streaming free to run up to the request-context deadline.
        let header_timeout = remaining.min(RESPONSE_HEADER_TIMEOUT);

        let mut url = target.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());

        let method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
        let mut request = self.http_client.request(method, url);
        request = request.headers(forward_headers(headers, original_host(headers)));

        if let Some(body) = &ctx.captured_body {
            request = request.body(body.clone());
        }

        // A response-header timeout is a transient upstream failure (502),
        // never the request-context deadline (504, §4.6e) — only an actually
        // elapsed `ctx.deadline` classifies as the latter, matching
        // original_source's `ResponseHeaderTimeout` handling.
        let upstream = match tokio::time::timeout(header_timeout, request.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) | Err(_) => {
                return Err(Instant::now() >= ctx.deadline);
            }
        };

        Ok(build_response(upstream))
    }
}

/// Hop-by-hop headers that must not be forwarded verbatim in either
/// direction (RFC 7230 §6.1), plus `Host` which reqwest manages itself.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn original_host(headers: &HeaderMap) -> Option<String> {
    headers.get(header::HOST).and_then(|v| v.to_str().ok()).map(String::from)
}

fn forward_headers(headers: &HeaderMap, original_host: Option<String>) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    if let Some(host) = original_host {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&host) {
            out.insert(reqwest::header::HeaderName::from_static("x-forwarded-host"), value);
        }
    }
    out
}

/// Streams the upstream response straight through, preserving status,
/// headers (minus hop-by-hop) and body without buffering it in full.
fn build_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers().iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| (StatusCode::BAD_GATEWAY, "invalid upstream response").into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identifier() -> ClientIdentifier {
        ClientIdentifier::new(true)
    }

    fn rate_limiter() -> Arc<RateLimiter> {
        RateLimiter::new(
            StdDuration::from_secs(3600),
            crate::ratelimit::limiter::PolicyDefaults {
                global: crate::ratelimit::ClientPolicy { capacity: 1000, refill_rate: 100.0 },
                ip_based: crate::ratelimit::ClientPolicy { capacity: 1000, refill_rate: 100.0 },
            },
        )
    }

    async fn pipeline_with_backends(urls: Vec<&str>) -> Arc<ProxyPipeline> {
        let backends: Vec<Backend> = urls.iter().map(|u| url::Url::parse(u).unwrap()).collect();
        ProxyPipeline::new(
            Arc::new(Balancer::new(backends)),
            rate_limiter(),
            identifier(),
            10,
            1024 * 1024,
            StdDuration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn retry_recovers_when_first_backend_fails() {
        let failing = MockServer::start().await;
        Mock::given(method("GET")).and(path("/x")).respond_with(ResponseTemplate::new(500)).mount(&failing).await;
        let healthy = MockServer::start().await;
        Mock::given(method("GET")).and(path("/x")).respond_with(ResponseTemplate::new(200).set_body_string("ok")).mount(&healthy).await;

        let pipeline = pipeline_with_backends(vec![&failing.uri(), &healthy.uri()]).await;
        let req = axum::extract::Request::builder().method("GET").uri("/x").body(Body::empty()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let response = pipeline.run(req, peer).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn all_backends_failing_returns_502() {
        let a = MockServer::start().await;
        Mock::given(method("GET")).and(path("/x")).respond_with(ResponseTemplate::new(500)).mount(&a).await;
        let b = MockServer::start().await;
        Mock::given(method("GET")).and(path("/x")).respond_with(ResponseTemplate::new(500)).mount(&b).await;

        let pipeline = pipeline_with_backends(vec![&a.uri(), &b.uri()]).await;
        let req = axum::extract::Request::builder().method("GET").uri("/x").body(Body::empty()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let response = pipeline.run(req, peer).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn no_backend_configured_returns_502() {
        let pipeline = pipeline_with_backends(vec![]).await;
        let req = axum::extract::Request::builder().method("GET").uri("/x").body(Body::empty()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let response = pipeline.run(req, peer).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn rate_limited_client_gets_429_without_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/x")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let pipeline = ProxyPipeline::new(
            Arc::new(Balancer::new(vec![url::Url::parse(&server.uri()).unwrap()])),
            RateLimiter::new(
                StdDuration::from_secs(3600),
                crate::ratelimit::limiter::PolicyDefaults {
                    global: crate::ratelimit::ClientPolicy { capacity: 0, refill_rate: 1.0 },
                    ip_based: crate::ratelimit::ClientPolicy { capacity: 0, refill_rate: 1.0 },
                },
            ),
            identifier(),
            10,
            1024 * 1024,
            StdDuration::from_secs(5),
        )
        .unwrap();

        let req = axum::extract::Request::builder().method("GET").uri("/x").body(Body::empty()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let response = pipeline.run(req, peer).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
    }

    #[tokio::test]
    async fn body_larger_than_ceiling_is_rejected_with_413() {
        let pipeline = ProxyPipeline::new(
            Arc::new(Balancer::new(vec![url::Url::parse("http://127.0.0.1:1").unwrap()])),
            rate_limiter(),
            identifier(),
            10,
            4,
            StdDuration::from_secs(5),
        )
        .unwrap();

        let req = axum::extract::Request::builder()
            .method("POST")
            .uri("/x")
            .body(Body::from("too long"))
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let response = pipeline.run(req, peer).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn admission_denied_when_semaphore_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(StdDuration::from_millis(300)))
            .mount(&server)
            .await;

        let pipeline = ProxyPipeline::new(
            Arc::new(Balancer::new(vec![url::Url::parse(&server.uri()).unwrap()])),
            rate_limiter(),
            identifier(),
            1,
            1024 * 1024,
            StdDuration::from_secs(5),
        )
        .unwrap();

        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let pipeline_a = Arc::clone(&pipeline);
        let first = tokio::spawn(async move {
            let req = axum::extract::Request::builder().method("GET").uri("/slow").body(Body::empty()).unwrap();
            pipeline_a.run(req, peer).await
        });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let req = axum::extract::Request::builder().method("GET").uri("/slow").body(Body::empty()).unwrap();
        let second_response = pipeline.run(req, peer).await;
        assert_eq!(second_response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let first_response = first.await.unwrap();
        assert_eq!(first_response.status(), StatusCode::OK);
    }
}
