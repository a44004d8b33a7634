//! Configuration management for the registrar.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use rollcall_common::constants::{
    DEFAULT_CONNECTION_BUFFER, DEFAULT_DISPATCH_PERIOD_SECS, DEFAULT_LEADER_PERIOD_SECS,
    DEFAULT_LEASE_SECS, DEFAULT_LISTEN_ADDR, DEFAULT_LOCK_TTL_MS, DEFAULT_LOCK_WAIT_MS,
    DEFAULT_MAX_CACHED_RESOURCES, DEFAULT_PUSH_TIMEOUT_MS, DEFAULT_REDIS_URL, MAX_LEASE_SECS,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address recorded for this server in the shared store (defaults to
    /// `listen_addr`)
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Lease, timer and push settings
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Resource snapshot cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Shared store backend
    #[serde(default)]
    pub store: StoreConfig,
}

/// Cluster timing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Node lease duration in seconds
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Leader timer period in seconds
    #[serde(default = "default_leader_period")]
    pub leader_period_secs: u64,

    /// Change dispatcher period in seconds
    #[serde(default = "default_dispatch_period")]
    pub dispatch_period_secs: u64,

    /// Bound for a single push in milliseconds
    #[serde(default = "default_push_timeout")]
    pub push_timeout_ms: u64,

    /// Events queued per connection
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease_secs(),
            leader_period_secs: default_leader_period(),
            dispatch_period_secs: default_dispatch_period(),
            push_timeout_ms: default_push_timeout(),
            connection_buffer: default_connection_buffer(),
        }
    }
}

impl ClusterConfig {
    pub fn leader_period(&self) -> Duration {
        Duration::from_secs(self.leader_period_secs)
    }

    pub fn dispatch_period(&self) -> Duration {
        Duration::from_secs(self.dispatch_period_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

/// Snapshot cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached resources
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local tables (single node)
    Memory,
    /// Shared Redis tables (cluster)
    Redis,
}

/// Store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Transaction lock expiry in milliseconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,

    /// Transaction lock wait in milliseconds
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            lock_ttl_ms: default_lock_ttl(),
            lock_wait_ms: default_lock_wait(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_lease_secs() -> u64 { DEFAULT_LEASE_SECS }
fn default_leader_period() -> u64 { DEFAULT_LEADER_PERIOD_SECS }
fn default_dispatch_period() -> u64 { DEFAULT_DISPATCH_PERIOD_SECS }
fn default_push_timeout() -> u64 { DEFAULT_PUSH_TIMEOUT_MS }
fn default_connection_buffer() -> usize { DEFAULT_CONNECTION_BUFFER }
fn default_max_entries() -> u64 { DEFAULT_MAX_CACHED_RESOURCES }
fn default_backend() -> StoreBackend { StoreBackend::Memory }
fn default_lock_ttl() -> u64 { DEFAULT_LOCK_TTL_MS }
fn default_lock_wait() -> u64 { DEFAULT_LOCK_WAIT_MS }

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref advertise) = args.advertise {
            config.advertise_addr = Some(advertise.clone());
        }
        if let Some(ref redis_url) = args.redis_url {
            config.store.redis_url = redis_url.clone();
            config.store.backend = StoreBackend::Redis;
        }

        config.validate()?;
        Ok(config)
    }

    /// Address this server registers under
    pub fn server_address(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.listen_addr)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.lease_secs <= self.cluster.leader_period_secs {
            anyhow::bail!(
                "cluster.lease_secs ({}) must exceed cluster.leader_period_secs ({})",
                self.cluster.lease_secs,
                self.cluster.leader_period_secs
            );
        }
        if self.cluster.lease_secs > MAX_LEASE_SECS {
            anyhow::bail!(
                "cluster.lease_secs ({}) must not exceed {}",
                self.cluster.lease_secs,
                MAX_LEASE_SECS
            );
        }
        if self.cluster.dispatch_period_secs == 0 || self.cluster.leader_period_secs == 0 {
            anyhow::bail!("timer periods must be at least one second");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            cluster: ClusterConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server_address(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.cluster.lease_secs, 20);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "advertise_addr = \"10.0.0.1:7070\"\n[store]\nbackend = \"redis\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.server_address(), "10.0.0.1:7070");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.cluster.leader_period_secs, 5);
    }

    #[test]
    fn test_lease_must_outlive_period() {
        let mut config = AppConfig::default();
        config.cluster.lease_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_has_upper_bound() {
        let mut config = AppConfig::default();
        config.cluster.lease_secs = MAX_LEASE_SECS;
        assert!(config.validate().is_ok());
        config.cluster.lease_secs = u64::MAX;
        assert!(config.validate().is_err());
    }
}
