//! Configuration types for tollgate.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! proxy opens a port. Invalid configs are rejected with a clear error rather
//! than silently falling back to defaults. `proxy_port` and `backend_urls`
//! additionally fall back to the `PROXY_PORT` / `BACKEND_URLS` environment
//! variables when absent from the file, so the gateway can run in
//! environments where only env vars are available (containers, CI).
//!
//! # Example
//! ```toml
//! proxy_port = 8080
//! backend_urls = "http://127.0.0.1:9001,http://127.0.0.1:9002"
//!
//! [rate_limiter.default]
//! capacity = 20
//! refill_rate = 5.0
//!
//! [rate_limiter.ip_based]
//! capacity = 10
//! refill_rate = 2.0
//!
//! [[rate_limiter.special_clients]]
//! id = "key:partner-acme"
//! capacity = 200
//! refill_rate = 50.0
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// TCP port the proxy listens on. Falls back to `PROXY_PORT` when unset.
    #[serde(default)]
    pub proxy_port: Option<u16>,

    /// Comma-separated list of absolute backend URLs. Falls back to
    /// `BACKEND_URLS` when unset.
    #[serde(default)]
    pub backend_urls: Option<String>,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Ambient knobs that aren't part of the core rate-limit/balancer contract
/// but every production deployment of this gateway needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Maximum concurrent in-flight requests (§4.6 step 5).
    ///
    /// Zero or negative configured values are replaced by 100, per spec.
    #[serde(default = "defaults::concurrency_limit")]
    pub concurrency_limit: i64,

    /// Default per-request deadline in seconds when the inbound request
    /// carries none (§4.6 step 4).
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bucket refill cadence in milliseconds (§4.2's `T`).
    #[serde(default = "defaults::refill_interval_ms")]
    pub refill_interval_ms: u64,

    /// Maximum request body size accepted for buffering/replay, in bytes.
    /// Requests with a larger body are rejected with `413` before any
    /// backend is contacted. Default 10 MiB (§9).
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,

    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: defaults::concurrency_limit(),
            request_timeout_secs: defaults::request_timeout_secs(),
            refill_interval_ms: defaults::refill_interval_ms(),
            max_body_bytes: defaults::max_body_bytes(),
            log_level: None,
        }
    }
}

impl GatewayConfig {
    /// Effective concurrency limit after applying the "zero/negative → 100"
    /// replacement rule from §4.6 step 5.
    pub fn effective_concurrency_limit(&self) -> usize {
        if self.concurrency_limit <= 0 {
            100
        } else {
            self.concurrency_limit as usize
        }
    }
}

/// Rate-limiter policy defaults, loaded once and handed to `RateLimiter::new`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub default: PolicyConfig,
    #[serde(default = "PolicyConfig::ip_based_default")]
    pub ip_based: PolicyConfig,
    #[serde(default)]
    pub special_clients: Vec<SpecialClientConfig>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default: PolicyConfig::default(),
            ip_based: PolicyConfig::ip_based_default(),
            special_clients: Vec::new(),
        }
    }
}

/// A `(capacity, refill_rate)` pair — the classification-rule defaults
/// described in §4.3.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PolicyConfig {
    pub capacity: u32,
    pub refill_rate: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { capacity: 20, refill_rate: 5.0 }
    }
}

impl PolicyConfig {
    fn ip_based_default() -> Self {
        Self { capacity: 10, refill_rate: 2.0 }
    }
}

/// A preloaded per-client policy override, applied at startup before the
/// listener binds (`rate_limiter.special_clients[]`, original_source's
/// `cfg.RateLimiter.SpecialClients`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpecialClientConfig {
    pub id: String,
    pub capacity: u32,
    pub refill_rate: f64,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()
    }

    /// Resolve `proxy_port`, falling back to `PROXY_PORT`, then validate.
    fn validate(mut self) -> anyhow::Result<Self> {
        if self.proxy_port.is_none() {
            if let Ok(env_port) = std::env::var("PROXY_PORT") {
                self.proxy_port = Some(
                    env_port
                        .parse()
                        .with_context(|| format!("PROXY_PORT={env_port} is not a valid port"))?,
                );
            }
        }
        anyhow::ensure!(self.proxy_port.is_some(), "proxy_port is required (config file or PROXY_PORT)");

        if self.backend_urls.is_none() {
            if let Ok(env_backends) = std::env::var("BACKEND_URLS") {
                self.backend_urls = Some(env_backends);
            }
        }
        anyhow::ensure!(
            self.backend_urls.as_deref().is_some_and(|s| !s.trim().is_empty()),
            "backend_urls is required (config file or BACKEND_URLS)"
        );

        for special in &self.rate_limiter.special_clients {
            anyhow::ensure!(special.capacity >= 1, "special client `{}`: capacity must be >= 1", special.id);
            anyhow::ensure!(
                special.refill_rate >= 0.1,
                "special client `{}`: refill_rate must be >= 0.1",
                special.id
            );
        }

        Ok(self)
    }

    /// Parse `backend_urls` into a list of absolute URLs, in order.
    pub fn parse_backend_urls(&self) -> anyhow::Result<Vec<url::Url>> {
        self.backend_urls
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|raw| url::Url::parse(raw).with_context(|| format!("invalid backend URL `{raw}`")))
            .collect()
    }
}

mod defaults {
    pub fn concurrency_limit() -> i64 {
        10
    }
    pub fn request_timeout_secs() -> u64 {
        60
    }
    pub fn refill_interval_ms() -> u64 {
        1_000
    }
    pub fn max_body_bytes() -> usize {
        10 * 1024 * 1024
    }
}
