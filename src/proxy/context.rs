//! Per-request state threaded through the attempt loop — §3's
//! `RequestContext` / §9's design note.
//!
//! original_source's `internal/handler/proxy.go` threads this through a
//! dynamically-typed `context.Context` (`retriesKey`, `originalBodyKey`,
//! `currentBackendKey`, ...). This port makes those keys fields on an
//! explicit struct owned by the one task running the pipeline for this
//! request, per spec.md §9.

use std::time::Instant;

use bytes::Bytes;

use crate::balancer::Backend;

/// Opaque, collision-resistant-enough-for-logging id: `(unix_nanos, peer)`.
#[derive(Debug, Clone)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(unix_nanos: u128, peer: std::net::SocketAddr) -> Self {
        Self(format!("{unix_nanos}-{peer}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ephemeral per-request state, mutated only by the task owning the request.
pub struct RequestContext {
    pub request_id: RequestId,
    pub client_id: String,
    pub start_time: Instant,
    pub retry_count: u32,
    pub max_retries: u32,
    pub captured_body: Option<Bytes>,
    pub chosen_backend: Option<Backend>,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(
        request_id: RequestId,
        client_id: String,
        max_retries: u32,
        captured_body: Option<Bytes>,
        deadline: Instant,
    ) -> Self {
        Self {
            request_id,
            client_id,
            start_time: Instant::now(),
            retry_count: 0,
            max_retries,
            captured_body,
            chosen_backend: None,
            deadline,
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }

    /// §4.6 step 7e: at the retry limit once `retry_count == max_retries - 1`.
    pub fn is_final_attempt(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}
