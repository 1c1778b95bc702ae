//! Named breaker and pool registries
//!
//! Breakers are keyed by target service name, pools by target host. Both
//! registries are plain service objects: the binary constructs one of each
//! and hands `Arc`s to whatever makes outbound calls.

use std::sync::Arc;

use common::Clock;
use dashmap::DashMap;
use tracing::info;

use crate::circuit_breaker::{BreakerConfig, BreakerHealth, BreakerStatus, CircuitBreaker};
use crate::connection_pool::{ConnectionPool, PoolConfig, PoolHealth, PoolStatus};
use crate::error::{PoolError, Result};

/// Circuit breakers by target name, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(breaker = name, "registering circuit breaker");
                Arc::new(CircuitBreaker::new(
                    name,
                    self.defaults.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Status of every breaker, sorted by name.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<_> = self.breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn health(&self) -> Vec<BreakerHealth> {
        let mut health: Vec<_> = self
            .breakers
            .iter()
            .map(|b| b.health_assessment())
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    /// Close every breaker; returns how many were reset.
    pub fn reset_all(&self) -> usize {
        let mut count = 0;
        for breaker in self.breakers.iter() {
            breaker.reset();
            count += 1;
        }
        info!(count, "all circuit breakers reset");
        count
    }
}

/// Connection pools by target host, sharing one HTTP client.
#[derive(Debug)]
pub struct PoolRegistry {
    defaults: PoolConfig,
    client: reqwest::Client,
    pools: DashMap<String, Arc<ConnectionPool>>,
}

impl PoolRegistry {
    pub fn new(defaults: PoolConfig, client: reqwest::Client) -> Self {
        Self {
            defaults,
            client,
            pools: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, target: &str) -> Arc<ConnectionPool> {
        self.pools
            .entry(target.to_string())
            .or_insert_with(|| {
                info!(target, "registering connection pool");
                Arc::new(ConnectionPool::new(
                    target,
                    self.defaults.clone(),
                    self.client.clone(),
                ))
            })
            .clone()
    }

    /// Pool for the host (and explicit port, if any) of `url`.
    pub fn pool_for_url(&self, url: &str) -> Result<Arc<ConnectionPool>> {
        let target = target_host(url)?;
        Ok(self.get_or_create(&target))
    }

    pub fn statuses(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<_> = self.pools.iter().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.target.cmp(&b.target));
        statuses
    }

    pub fn health(&self) -> Vec<PoolHealth> {
        let mut health: Vec<_> = self.pools.iter().map(|p| p.health_assessment()).collect();
        health.sort_by(|a, b| a.target.cmp(&b.target));
        health
    }
}

/// `host` or `host:port` for a URL.
pub fn target_host(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| PoolError::InvalidRequest {
        target: url.to_string(),
        message: format!("invalid url: {e}"),
    })?;
    let host = parsed.host_str().ok_or_else(|| PoolError::InvalidRequest {
        target: url.to_string(),
        message: "url has no host".into(),
    })?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use common::ManualClock;

    fn breakers() -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig::default(), Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn breakers_are_shared_by_name() {
        let registry = breakers();
        let a = registry.get_or_create("oauth-primary");
        let b = registry.get_or_create("oauth-primary");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("oauth-fallback").is_none());
    }

    #[test]
    fn statuses_are_sorted_by_name() {
        let registry = breakers();
        registry.get_or_create("oauth-primary");
        registry.get_or_create("oauth-fallback");

        let names: Vec<_> = registry.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["oauth-fallback", "oauth-primary"]);
    }

    #[test]
    fn reset_all_closes_every_breaker() {
        let registry = breakers();
        registry.get_or_create("oauth-primary").force_state(CircuitState::Open);
        registry.get_or_create("oauth-fallback").force_state(CircuitState::HalfOpen);

        assert_eq!(registry.reset_all(), 2);
        assert!(
            registry
                .statuses()
                .iter()
                .all(|s| s.state == CircuitState::Closed)
        );
    }

    #[test]
    fn pools_are_keyed_by_host() {
        let registry = PoolRegistry::new(PoolConfig::default(), reqwest::Client::new());
        let a = registry.pool_for_url("https://api.airtable.com/v0/meta").unwrap();
        let b = registry.pool_for_url("https://api.airtable.com/oauth2/v1/token").unwrap();
        let c = registry.pool_for_url("http://127.0.0.1:8080/token").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.target(), "api.airtable.com");
        assert_eq!(c.target(), "127.0.0.1:8080");
        assert_eq!(registry.statuses().len(), 2);
    }

    #[test]
    fn invalid_url_has_no_pool() {
        let registry = PoolRegistry::new(PoolConfig::default(), reqwest::Client::new());
        assert!(registry.pool_for_url("not a url").is_err());
    }
}
