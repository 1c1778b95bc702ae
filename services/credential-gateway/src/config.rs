//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The admin token is loaded from the ADMIN_TOKEN env var or
//! `admin_token_file`, never stored in the TOML directly.

use common::Secret;
use resilience::{BreakerConfig, PoolConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub connection_pool: PoolConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Bearer token required on /admin routes; open when unset.
    #[serde(skip)]
    pub admin_token: Option<Secret<String>>,
    #[serde(default)]
    pub admin_token_file: Option<PathBuf>,
}

/// Instance credential file
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub sweep_interval_secs: u64,
    /// Tokens expiring within this window are refreshed before use
    pub expiry_skew_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            expiry_skew_secs: 60,
        }
    }
}

/// Token endpoints
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub primary_token_url: String,
    /// Direct-provider endpoint tried once when the primary is unavailable
    #[serde(default)]
    pub fallback_token_url: Option<String>,
    #[serde(default = "default_oauth_timeout")]
    pub timeout_secs: u64,
}

fn default_max_connections() -> usize {
    1000
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_oauth_timeout() -> u64 {
    30
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn expiry_skew(&self) -> Duration {
        Duration::from_secs(self.expiry_skew_secs)
    }
}

impl OAuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, then overlay
    /// environment variables.
    ///
    /// Admin token resolution order:
    /// 1. ADMIN_TOKEN env var
    /// 2. admin_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            config.server.admin_token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.server.admin_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read admin_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.server.admin_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> common::Result<()> {
        require_http_url("primary_token_url", &self.oauth.primary_token_url)?;
        if let Some(url) = &self.oauth.fallback_token_url {
            require_http_url("fallback_token_url", url)?;
        }

        let non_zero = [
            ("oauth.timeout_secs", self.oauth.timeout_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
            ("server.max_connections", self.server.max_connections as u64),
            ("server.drain_timeout_secs", self.server.drain_timeout_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        self.circuit_breaker.validate()?;
        self.connection_pool.validate()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("credential-gateway.toml")
    }
}

fn require_http_url(name: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::InvalidUrl {
            field: name.to_string(),
            value: url.to_string(),
        })
    }
}
