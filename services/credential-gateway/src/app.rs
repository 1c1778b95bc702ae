//! Service wiring
//!
//! Builds the long-lived service objects from config and shares them with
//! every handler through `AppState`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use common::{Clock, Secret};
use credential_cache::CredentialCache;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_provider::{HttpTokenEndpoint, TokenEndpoint};
use resilience::{BreakerEvent, BreakerRegistry, CircuitBreaker, PoolRegistry};
use token_refresh::{
    CredentialResolver, FileCredentialStore, TokenRefreshOrchestrator, TracingAuditSink,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::Config;

pub const PRIMARY_BREAKER: &str = "oauth-primary";
pub const FALLBACK_BREAKER: &str = "oauth-fallback";

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub breakers: Arc<BreakerRegistry>,
    pub pools: Arc<PoolRegistry>,
    pub cache: Arc<CredentialCache>,
    pub resolver: Arc<CredentialResolver>,
    pub prometheus: PrometheusHandle,
    pub admin_token: Option<Arc<Secret<String>>>,
    pub started_at: Instant,
}

/// Construct every service object the gateway runs with.
pub async fn build_state(
    config: &Config,
    clock: Arc<dyn Clock>,
    http_client: reqwest::Client,
    prometheus: PrometheusHandle,
) -> Result<AppState> {
    let breakers = Arc::new(BreakerRegistry::new(
        config.circuit_breaker.clone(),
        clock.clone(),
    ));
    let pools = Arc::new(PoolRegistry::new(
        config.connection_pool.clone(),
        http_client,
    ));

    let primary = token_endpoint(
        PRIMARY_BREAKER,
        &config.oauth.primary_token_url,
        config.oauth.timeout(),
        &breakers,
        &pools,
    )?;
    let fallback = config
        .oauth
        .fallback_token_url
        .as_deref()
        .map(|url| {
            token_endpoint(
                FALLBACK_BREAKER,
                url,
                config.oauth.timeout(),
                &breakers,
                &pools,
            )
        })
        .transpose()?;

    let store = Arc::new(
        FileCredentialStore::load(config.store.path.clone())
            .await
            .with_context(|| format!("failed to load store {}", config.store.path.display()))?,
    );
    let cache = Arc::new(CredentialCache::new(clock.clone()));

    let orchestrator = Arc::new(TokenRefreshOrchestrator::new(
        primary,
        fallback,
        store.clone(),
        cache.clone(),
        Arc::new(TracingAuditSink),
        clock.clone(),
    ));
    let resolver = Arc::new(CredentialResolver::new(
        cache.clone(),
        store,
        orchestrator,
        clock,
        config.cache.expiry_skew(),
    ));

    Ok(AppState {
        breakers,
        pools,
        cache,
        resolver,
        prometheus,
        admin_token: config.server.admin_token.clone().map(Arc::new),
        started_at: Instant::now(),
    })
}

fn token_endpoint(
    name: &str,
    url: &str,
    timeout: Duration,
    breakers: &BreakerRegistry,
    pools: &PoolRegistry,
) -> Result<Arc<dyn TokenEndpoint>> {
    let pool = pools
        .pool_for_url(url)
        .with_context(|| format!("invalid token endpoint url for {name}"))?;
    let breaker = breakers.get_or_create(name);
    spawn_breaker_observer(breaker.clone());
    info!(endpoint = name, target = pool.target(), "token endpoint configured");
    Ok(Arc::new(HttpTokenEndpoint::new(
        name, url, timeout, breaker, pool,
    )))
}

/// Log every state change of `breaker` until it is dropped.
pub fn spawn_breaker_observer(breaker: Arc<CircuitBreaker>) -> tokio::task::JoinHandle<()> {
    let mut events = breaker.subscribe();
    drop(breaker);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BreakerEvent::StateChanged { name, from, to, .. }) => {
                    warn!(breaker = %name, %from, %to, "circuit breaker state changed");
                }
                Ok(BreakerEvent::Rejected { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "circuit breaker observer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
