//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults, so a partial file is valid. Secrets (proxy
//! credentials) are referenced by env-var name in the config and resolved
//! at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub marketplace: MarketplaceConfig,
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of listing tasks in flight at once.
    pub max_concurrent_tasks: usize,
    /// Pause between rounds.
    pub round_delay_secs: u64,
    /// Timeout applied to every outbound marketplace request.
    pub request_timeout_secs: u64,
    /// Randomized pause after each listing, while still holding its permit.
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Cool-down window applied to a listing after a 429.
    pub rate_limit_backoff_min_secs: u64,
    pub rate_limit_backoff_max_secs: u64,
    /// Single-round price moves above this percentage are logged as anomalous.
    pub anomaly_threshold_pct: u32,
    /// How many recent history rows to read per listing.
    pub history_window: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            round_delay_secs: 5,
            request_timeout_secs: 30,
            jitter_min_ms: 100,
            jitter_max_ms: 300,
            rate_limit_backoff_min_secs: 30,
            rate_limit_backoff_max_secs: 120,
            anomaly_threshold_pct: 20,
            history_window: 10,
        }
    }
}

impl EngineConfig {
    pub fn round_delay(&self) -> Duration {
        Duration::from_secs(self.round_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://demper.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketplaceConfig {
    /// Public offer-listing query; `{id}` is replaced by the external id.
    pub offers_url: String,
    pub price_update_url: String,
    /// Cheap authenticated GET used as the session liveness probe.
    pub session_probe_url: String,
    /// Paginated seller catalog.
    pub catalog_url: String,
    pub city_id: String,
    pub zone_id: String,
    pub offers_limit: u32,
    pub catalog_page_size: u32,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            offers_url: "https://kaspi.kz/yml/offer-view/offers/{id}".to_string(),
            price_update_url: "https://mc.shop.kaspi.kz/pricefeed/upload/merchant/process"
                .to_string(),
            session_probe_url: "https://mc.shop.kaspi.kz/s/m".to_string(),
            catalog_url: "https://mc.shop.kaspi.kz/bff/offer-view/list".to_string(),
            city_id: "750000000".to_string(),
            zone_id: "Magnum_ZONE1".to_string(),
            offers_limit: 5,
            catalog_page_size: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub host: String,
    pub username_env: Option<String>,
    pub password_env: Option<String>,
    /// Inclusive port range expanded into the egress pool.
    pub port_from: u16,
    pub port_to: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            username_env: None,
            password_env: None,
            port_from: 10001,
            port_to: 10999,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// External login helper: program followed by its arguments.
    pub refresh_command: Vec<String>,
    pub refresh_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_command: Vec::new(),
            refresh_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8088,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text and validate it.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_tasks == 0 {
            anyhow::bail!("engine.max_concurrent_tasks must be at least 1");
        }
        if self.engine.jitter_min_ms > self.engine.jitter_max_ms {
            anyhow::bail!("engine.jitter_min_ms must not exceed engine.jitter_max_ms");
        }
        if self.engine.rate_limit_backoff_min_secs > self.engine.rate_limit_backoff_max_secs {
            anyhow::bail!(
                "engine.rate_limit_backoff_min_secs must not exceed engine.rate_limit_backoff_max_secs"
            );
        }
        if self.proxy.enabled && self.proxy.port_from > self.proxy.port_to {
            anyhow::bail!("proxy.port_from must not exceed proxy.port_to");
        }
        Ok(())
    }
}
