use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod balancer;
mod config;
mod error;
mod identity;
mod proxy;
mod ratelimit;
mod repository;

use balancer::Balancer;
use config::Config;
use identity::ClientIdentifier;
use proxy::ProxyPipeline;
use ratelimit::{limiter::PolicyDefaults, ClientPolicy, RateLimiter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tollgate=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("TOLLGATE_CONFIG").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/etc/tollgate/config.toml"));

    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let backends = config.parse_backend_urls().context("parsing backend_urls")?;
    anyhow::ensure!(!backends.is_empty(), "at least one backend URL is required");

    info!(port = config.proxy_port, backend_count = backends.len(), "tollgate starting");

    let balancer = Arc::new(Balancer::new(backends));

    let defaults = PolicyDefaults {
        global: ClientPolicy { capacity: config.rate_limiter.default.capacity, refill_rate: config.rate_limiter.default.refill_rate },
        ip_based: ClientPolicy { capacity: config.rate_limiter.ip_based.capacity, refill_rate: config.rate_limiter.ip_based.refill_rate },
    };
    let rate_limiter = RateLimiter::new(Duration::from_millis(config.gateway.refill_interval_ms), defaults);

    // Preload special-client overrides before the listener binds, so the
    // first request from a known client already sees its override.
    for special in &config.rate_limiter.special_clients {
        rate_limiter.upsert_client(&special.id, special.capacity, special.refill_rate);
        info!(client_id = %special.id, capacity = special.capacity, refill_rate = special.refill_rate, "preloaded special client");
    }

    let identifier = ClientIdentifier::new(true);

    let pipeline = ProxyPipeline::new(
        Arc::clone(&balancer),
        Arc::clone(&rate_limiter),
        identifier,
        config.gateway.effective_concurrency_limit(),
        config.gateway.max_body_bytes,
        Duration::from_secs(config.gateway.request_timeout_secs),
    )?;

    let app = Router::new()
        .route("/healthz", axum::routing::get(api::health::healthz))
        .fallback(ProxyPipeline::handle)
        .with_state(pipeline)
        .nest_service("/api/ratelimit", api::admin::router(Arc::clone(&rate_limiter)))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.proxy_port.expect("validated at config load")).parse()?;
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    rate_limiter.stop();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Invoked via `tollgate --healthcheck` from a Docker HEALTHCHECK: hits
/// `/healthz` and exits 0/1, avoiding a dependency on curl/wget in the image.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("PROXY_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        warn!(status = %resp.status(), "healthcheck failed");
        std::process::exit(1);
    }
}
