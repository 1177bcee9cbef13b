//! Client identification — §4.4.
//!
//! A pure function of request headers, query string, and peer address; no
//! I/O, fully unit-testable. Grounded directly on original_source's
//! `internal/service/client_identifier.go` (`ClientIdentifierService`).

use std::net::IpAddr;

use axum::http::{HeaderMap, Uri};

use crate::ratelimit::limiter::IP_PREFIX;

/// Resolves a stable client id from an inbound request. §4.4.
#[derive(Debug, Clone, Copy)]
pub struct ClientIdentifier {
    pub prioritize_api_key: bool,
}

impl ClientIdentifier {
    pub fn new(prioritize_api_key: bool) -> Self {
        Self { prioritize_api_key }
    }

    /// §4.4's resolution order.
    pub fn identify(&self, headers: &HeaderMap, uri: &Uri, peer: IpAddr) -> String {
        if self.prioritize_api_key {
            if let Some(key) = Self::api_key(headers, uri) {
                return key;
            }
        }
        format!("{IP_PREFIX}{}", Self::client_ip(headers, peer))
    }

    /// 1. `X-API-Key` header, 2. `Authorization: Bearer <token>`, 3. `api_key` query param.
    fn api_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
        if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }

        if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }

        if let Some(query) = uri.query() {
            for pair in query.split('&') {
                let mut parts = pair.splitn(2, '=');
                if parts.next() == Some("api_key") {
                    if let Some(value) = parts.next() {
                        if !value.is_empty() {
                            return Some(value.to_string());
                        }
                    }
                }
            }
        }

        None
    }

    /// 1. First entry of `X-Forwarded-For`, 2. `X-Real-IP`, 3. the peer's address.
    fn client_ip(headers: &HeaderMap, peer: IpAddr) -> String {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }

        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }

        peer.to_string()
    }
}
