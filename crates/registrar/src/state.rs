//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::access::ResourceAccess;
use crate::cache::ResourceCache;
use crate::cluster::LeaderTimer;
use crate::config::{AppConfig, StoreBackend};
use crate::store::{AnyGateway, Gateway, MemoryGateway, RedisGateway};
use crate::transport::ConnectionHub;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Shared coordination store
    pub gateway: Arc<AnyGateway>,

    /// Client-facing resource operations
    pub access: Arc<ResourceAccess<AnyGateway>>,

    /// Open client connections
    pub hub: Arc<ConnectionHub>,

    /// Lease, election and connection lifecycle
    pub leader: Arc<LeaderTimer<AnyGateway, ConnectionHub>>,

    /// Local resource snapshots
    pub cache: Arc<ResourceCache>,
}

impl AppState {
    /// Create new application state, connecting to the configured store
    pub async fn new(config: AppConfig, hub: Arc<ConnectionHub>) -> Result<Self> {
        let gateway = Arc::new(connect_store(&config).await?);
        let cache = Arc::new(ResourceCache::new(config.cache.max_entries));
        let access = Arc::new(ResourceAccess::new(gateway.clone(), cache.clone()));
        let leader = Arc::new(LeaderTimer::new(
            config.server_address().to_string(),
            config.cluster.lease_secs,
            gateway.clone(),
            hub.clone(),
        ));

        Ok(Self {
            config,
            gateway,
            access,
            hub,
            leader,
            cache,
        })
    }

    /// Whether the shared store answers
    pub async fn store_ready(&self) -> bool {
        match self.gateway.as_ref() {
            AnyGateway::Memory(_) => true,
            AnyGateway::Redis(redis) => redis.ping().await,
        }
    }

    pub async fn current_sequence(&self) -> Option<u64> {
        self.gateway.current_sequence().await.ok()
    }
}

async fn connect_store(config: &AppConfig) -> Result<AnyGateway> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, state is not shared with other servers");
            Ok(AnyGateway::Memory(MemoryGateway::new()))
        }
        StoreBackend::Redis => {
            let gateway = RedisGateway::connect(
                &config.store.redis_url,
                Duration::from_millis(config.store.lock_ttl_ms),
                Duration::from_millis(config.store.lock_wait_ms),
            )
            .await
            .context("Failed to connect to Redis")?;
            tracing::info!("✅ Redis connected: {}", config.store.redis_url);
            Ok(AnyGateway::Redis(gateway))
        }
    }
}
