//! Credential Gateway
//!
//! Resolves per-instance bearer credentials for an outbound proxy:
//! 1. Serves cached tokens, refreshing them through the OAuth provider on expiry
//! 2. Guards the token endpoints with circuit breakers and retrying pools
//! 3. Exposes health, Prometheus metrics and an admin API

mod admin;
mod app;
mod config;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use common::SystemClock;
use resilience::HealthStatus;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .merge(admin::router(state))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting credential-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store = %config.store.path.display(),
        fallback = config.oauth.fallback_token_url.is_some(),
        admin_auth = config.server.admin_token.is_some(),
        "configuration loaded"
    );

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let state = app::build_state(
        &config,
        Arc::new(SystemClock),
        http_client,
        prometheus_handle,
    )
    .await?;

    let (watcher_tx, watcher_rx) = tokio::sync::watch::channel(false);
    let watcher = credential_cache::spawn_watcher(
        state.cache.clone(),
        config.cache.sweep_interval(),
        watcher_rx,
    );

    let app = build_router(state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    let _ = watcher_tx.send(true);

    let drain_timeout = config.server.drain_timeout();
    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if tokio::time::timeout(drain_timeout, watcher).await.is_err() {
        warn!("cache watcher did not stop in time");
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: aggregates breakers, pools and the cache.
/// Returns 200 while no dependency is unhealthy, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let breakers = state.breakers.health();
    let pools = state.pools.health();
    let cache = state.cache.statistics();

    let open_breakers = breakers.iter().filter(|b| !b.healthy).count();
    let worst_pool = pools
        .iter()
        .map(|p| p.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    let status = if open_breakers > 0 || worst_pool == HealthStatus::Unhealthy {
        HealthStatus::Unhealthy
    } else if worst_pool == HealthStatus::Degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    let status_code = match status {
        HealthStatus::Unhealthy => axum::http::StatusCode::SERVICE_UNAVAILABLE,
        _ => axum::http::StatusCode::OK,
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "circuit_breakers": breakers,
        "connection_pools": pools,
        "cache": cache,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
