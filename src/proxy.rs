//! Proxy selection for outbound marketplace requests.
//!
//! The egress pool is a single provider host expanded over a port range.
//! Each logical key (a SKU, a merchant id) hashes to a fixed slot in the
//! pool, so repeated requests for the same key reuse the same egress and
//! different keys spread across the pool. Usage counters reset hourly.

use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{AppConfig, ProxyConfig};

const USAGE_RESET_INTERVAL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One egress address.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl ProxyEndpoint {
    /// Proxy URL without credentials (safe to log and to key caches on).
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Build a reqwest proxy routing all schemes through this endpoint.
    pub fn to_reqwest(&self) -> reqwest::Result<reqwest::Proxy> {
        let proxy = reqwest::Proxy::all(self.url())?;
        Ok(match (&self.username, &self.password) {
            (Some(user), Some(pass)) => proxy.basic_auth(user, pass.expose_secret()),
            _ => proxy,
        })
    }
}

/// Snapshot of pool usage since the last reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStats {
    pub pool_size: usize,
    pub total_requests: u64,
    pub usage: HashMap<usize, u64>,
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

struct UsageState {
    counts: HashMap<usize, u64>,
    last_reset: Instant,
}

/// Hands out an egress endpoint per logical key.
///
/// An empty pool means proxying is disabled and every request goes direct.
pub struct ProxySelector {
    pool: Vec<ProxyEndpoint>,
    usage: Mutex<UsageState>,
    reset_interval: Duration,
}

impl ProxySelector {
    pub fn new(pool: Vec<ProxyEndpoint>) -> Self {
        Self {
            pool,
            usage: Mutex::new(UsageState {
                counts: HashMap::new(),
                last_reset: Instant::now(),
            }),
            reset_interval: USAGE_RESET_INTERVAL,
        }
    }

    /// Direct connections only.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Build the pool from configuration, resolving credentials from env.
    pub fn from_config(cfg: &ProxyConfig) -> Result<Self> {
        if !cfg.enabled {
            info!("Proxy disabled, using direct connections");
            return Ok(Self::disabled());
        }
        if cfg.host.is_empty() {
            anyhow::bail!("proxy.enabled is set but proxy.host is empty");
        }

        let username = cfg
            .username_env
            .as_deref()
            .map(AppConfig::resolve_env)
            .transpose()?;
        let password = cfg
            .password_env
            .as_deref()
            .map(AppConfig::resolve_env)
            .transpose()?
            .map(SecretString::new);

        let pool: Vec<ProxyEndpoint> = (cfg.port_from..=cfg.port_to)
            .map(|port| ProxyEndpoint {
                host: cfg.host.clone(),
                port,
                username: username.clone(),
                password: password.clone(),
            })
            .collect();

        info!(host = %cfg.host, pool_size = pool.len(), "Proxy pool ready");
        Ok(Self::new(pool))
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn is_enabled(&self) -> bool {
        !self.pool.is_empty()
    }

    /// Pick the egress for `key`. Returns `None` when proxying is disabled.
    pub fn select(&self, key: &str) -> Option<ProxyEndpoint> {
        if self.pool.is_empty() {
            return None;
        }
        let index = self.slot_for(key);
        self.mark_used(index);
        let endpoint = self.pool[index].clone();
        debug!(key, proxy = %endpoint.url(), "Proxy selected");
        Some(endpoint)
    }

    /// Current usage statistics.
    pub fn stats(&self) -> ProxyStats {
        let mut usage = self.lock_usage();
        self.maybe_reset(&mut usage);
        ProxyStats {
            pool_size: self.pool.len(),
            total_requests: usage.counts.values().sum(),
            usage: usage.counts.clone(),
        }
    }

    fn slot_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.pool.len() as u64) as usize
    }

    fn mark_used(&self, index: usize) {
        let mut usage = self.lock_usage();
        self.maybe_reset(&mut usage);
        *usage.counts.entry(index).or_insert(0) += 1;
    }

    fn maybe_reset(&self, usage: &mut UsageState) {
        if usage.last_reset.elapsed() > self.reset_interval {
            usage.counts.clear();
            usage.last_reset = Instant::now();
        }
    }

    fn lock_usage(&self) -> std::sync::MutexGuard<'_, UsageState> {
        // Counters stay meaningful even if a holder panicked.
        self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
