//! Primary Storage Drivers
//!
//! Provides the volume lifecycle surface used by the motion strategy:
//! - Default: agent commands with an endpoint retry loop
//! - Legacy: direct hypervisor-specific commands against a single pool host
//! - Managed: per-volume resources on a managed backend via an injected client

pub mod default;
pub mod endpoint;
pub mod legacy;
pub mod listener;
pub mod managed;
pub mod managed_client;

pub use default::*;
pub use endpoint::*;
pub use legacy::*;
pub use listener::*;
pub use managed::*;
pub use managed_client::*;

use crate::config::DriverConfig;
use crate::dispatch::{AsyncCompletionDispatcher, CommandOutcome, CompletionCallback};
use crate::domain::model::{Host, PoolId, PoolType, SharedVolume, StoragePool, Volume};
use crate::domain::ports::{AgentChannelRef, EndpointSelectorRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Driver Contract
// =============================================================================

/// Result of a synchronous volume create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedVolume {
    /// Path (filesystem pools) or locator (managed pools) of the new volume
    pub path: String,
    /// Backend locator, when the backend reports one
    pub locator: Option<String>,
    pub size_bytes: u64,
}

/// Volume lifecycle operations offered by a primary storage backend
#[async_trait]
pub trait PrimaryStorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create `volume` on `pool` and wait for the result
    async fn create_volume(&self, volume: &Volume, pool: &StoragePool) -> Result<CreatedVolume>;

    /// Create `volume` on `pool` without waiting; `callback` fires exactly once
    fn create_volume_async(
        &self,
        volume: SharedVolume,
        pool: StoragePool,
        callback: CompletionCallback<CommandOutcome>,
    );

    /// Delete `volume`; `false` when the backend refused
    async fn delete_volume(&self, volume: &Volume, pool: &StoragePool) -> Result<bool>;

    /// Delete `volume` without waiting; `callback` fires exactly once
    fn delete_volume_async(
        &self,
        volume: SharedVolume,
        pool: StoragePool,
        callback: CompletionCallback<CommandOutcome>,
    );

    /// Allow `host` to attach `volume`, returning the locator it attaches with
    async fn grant_access(&self, volume: &Volume, host: &Host, pool: &StoragePool)
        -> Result<String>;

    async fn revoke_access(&self, volume: &Volume, host: &Host, pool: &StoragePool)
        -> Result<bool>;

    async fn capacity(&self, pool: &StoragePool) -> Result<u64>;

    async fn available_capacity(&self, pool: &StoragePool) -> Result<u64>;
}

pub type PrimaryStorageDriverRef = Arc<dyn PrimaryStorageDriver>;

// =============================================================================
// Driver Selection
// =============================================================================

/// Driver variant serving an unmanaged pool type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Default,
    Legacy,
}

impl DriverKind {
    pub fn for_pool_type(pool_type: PoolType) -> Self {
        match pool_type {
            PoolType::Filesystem | PoolType::Lvm => DriverKind::Legacy,
            PoolType::NetworkFilesystem
            | PoolType::SharedMountPoint
            | PoolType::Iscsi
            | PoolType::Rbd => DriverKind::Default,
        }
    }
}

/// Resolves the driver responsible for a pool
pub struct DriverRegistry {
    default: PrimaryStorageDriverRef,
    legacy: PrimaryStorageDriverRef,
    managed: DashMap<PoolId, Arc<ManagedPrimaryDriver>>,
}

impl DriverRegistry {
    /// Create a registry with the default and legacy drivers wired to `channel`
    pub fn new(
        channel: AgentChannelRef,
        selector: EndpointSelectorRef,
        config: &DriverConfig,
    ) -> Self {
        let dispatcher = AsyncCompletionDispatcher::new(channel.clone());
        Self {
            default: Arc::new(DefaultPrimaryDriver::new(
                channel.clone(),
                dispatcher.clone(),
                selector.clone(),
                config.send_attempts,
            )),
            legacy: Arc::new(LegacyPrimaryDriver::new(channel, dispatcher, selector)),
            managed: DashMap::new(),
        }
    }

    /// Register the managed driver for a managed pool
    pub fn register_managed(&self, pool_id: PoolId, driver: Arc<ManagedPrimaryDriver>) {
        info!("Registering managed driver for pool {} ({})", pool_id, driver.backend());
        self.managed.insert(pool_id, driver);
    }

    pub fn for_pool(&self, pool: &StoragePool) -> Result<PrimaryStorageDriverRef> {
        if pool.managed {
            return self
                .managed
                .get(&pool.id)
                .map(|d| d.value().clone() as PrimaryStorageDriverRef)
                .ok_or_else(|| Error::DriverUnavailable {
                    pool: pool.id.to_string(),
                });
        }

        Ok(match DriverKind::for_pool_type(pool.pool_type) {
            DriverKind::Default => self.default.clone(),
            DriverKind::Legacy => self.legacy.clone(),
        })
    }

    /// Close every managed backend client
    pub async fn shutdown(&self) {
        let drivers: Vec<_> = self.managed.iter().map(|e| e.value().clone()).collect();
        for driver in drivers {
            if let Err(e) = driver.close().await {
                warn!("Failed to close managed backend {}: {}", driver.backend(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockAgentChannel;
    use crate::testing::pool;
    use assert_matches::assert_matches;

    fn registry() -> DriverRegistry {
        let channel: AgentChannelRef = Arc::new(MockAgentChannel::new());
        let selector: EndpointSelectorRef = Arc::new(StaticEndpointSelector::new(vec![]));
        DriverRegistry::new(channel, selector, &DriverConfig::default())
    }

    #[test]
    fn test_pool_type_selects_variant() {
        assert_eq!(
            DriverKind::for_pool_type(PoolType::NetworkFilesystem),
            DriverKind::Default
        );
        assert_eq!(DriverKind::for_pool_type(PoolType::Lvm), DriverKind::Legacy);
        assert_eq!(
            DriverKind::for_pool_type(PoolType::Filesystem),
            DriverKind::Legacy
        );
    }

    #[test]
    fn test_registry_resolves_by_pool() {
        let registry = registry();

        let nfs = pool("p1", false);
        assert_eq!(registry.for_pool(&nfs).unwrap().name(), "default");

        let mut local = pool("p2", false);
        local.pool_type = PoolType::Lvm;
        assert_eq!(registry.for_pool(&local).unwrap().name(), "legacy");
    }

    #[test]
    fn test_unregistered_managed_pool() {
        let registry = registry();
        let err = registry.for_pool(&pool("m1", true)).err().unwrap();
        assert_matches!(err, Error::DriverUnavailable { ref pool } if pool == "m1");
    }
}
