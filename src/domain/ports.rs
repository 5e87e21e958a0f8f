//! Domain Ports - Boundaries between the migration core and external systems
//!
//! Persistence, the agent messaging channel and endpoint selection are
//! external collaborators. The core only sees these traits; concrete
//! adapters are injected through constructors.

use crate::domain::model::{
    DetailKey, Host, HostId, PoolId, Snapshot, StoragePool, Volume, VolumeDetail, VolumeId,
};
use crate::error::Result;
use crate::protocol::{Command, Endpoint, RemoteReply};
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Agent Messaging Channel Port
// =============================================================================

/// Invoked once with the outcome of an asynchronous send
pub type ReplyListener = Box<dyn FnOnce(RemoteReply) + Send + 'static>;

/// Port for sending commands to host agents
#[async_trait]
pub trait AgentChannel: Send + Sync + 'static {
    /// Send a command and wait for its outcome
    async fn send(&self, endpoint: &Endpoint, command: Command) -> RemoteReply;

    /// Send a command without waiting; `listener` runs on a runtime thread
    /// once the outcome is known
    fn send_async(self: Arc<Self>, endpoint: Endpoint, command: Command, listener: ReplyListener) {
        tokio::spawn(async move {
            let reply = self.send(&endpoint, command).await;
            listener(reply);
        });
    }
}

// =============================================================================
// Endpoint Selection Port
// =============================================================================

/// Port for choosing which host agents may act on a pool
#[async_trait]
pub trait EndpointSelector: Send + Sync {
    /// Candidate endpoints in preference order
    async fn select(&self, pool: &StoragePool) -> Result<Vec<Endpoint>>;
}

// =============================================================================
// Persistence Ports
// =============================================================================

/// Port for volume records
#[async_trait]
pub trait VolumeRepository: Send + Sync {
    async fn get(&self, id: &VolumeId) -> Result<Option<Volume>>;

    /// Persist the given volume record, replacing the stored one
    async fn update(&self, volume: &Volume) -> Result<()>;

    /// Persist every record or none of them
    async fn update_all(&self, volumes: &[Volume]) -> Result<()>;
}

/// Port for storage pool records
#[async_trait]
pub trait StoragePoolRepository: Send + Sync {
    async fn get(&self, id: &PoolId) -> Result<Option<StoragePool>>;

    async fn update_capacity(&self, id: &PoolId, capacity_bytes: u64, used_bytes: u64)
        -> Result<()>;

    async fn update_local_path(&self, id: &PoolId, local_path: &str) -> Result<()>;
}

/// Port for host records
#[async_trait]
pub trait HostRepository: Send + Sync {
    async fn get(&self, id: &HostId) -> Result<Option<Host>>;

    /// Hosts able to reach the given pool
    async fn hosts_for_pool(&self, pool: &StoragePool) -> Result<Vec<Host>>;
}

/// Port for snapshot records
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn list_by_volume(&self, volume_id: &VolumeId) -> Result<Vec<Snapshot>>;
}

/// Port for volume audit details
#[async_trait]
pub trait VolumeDetailRepository: Send + Sync {
    async fn add(&self, volume_id: &VolumeId, key: DetailKey, value: &str) -> Result<()>;

    async fn list(&self, volume_id: &VolumeId) -> Result<Vec<VolumeDetail>>;

    async fn remove(&self, volume_id: &VolumeId, key: DetailKey) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type AgentChannelRef = Arc<dyn AgentChannel>;
pub type EndpointSelectorRef = Arc<dyn EndpointSelector>;
pub type VolumeRepositoryRef = Arc<dyn VolumeRepository>;
pub type StoragePoolRepositoryRef = Arc<dyn StoragePoolRepository>;
pub type HostRepositoryRef = Arc<dyn HostRepository>;
pub type SnapshotRepositoryRef = Arc<dyn SnapshotRepository>;
pub type VolumeDetailRepositoryRef = Arc<dyn VolumeDetailRepository>;

/// Persistence ports consumed by the motion strategy
#[derive(Clone)]
pub struct Repositories {
    pub volumes: VolumeRepositoryRef,
    pub pools: StoragePoolRepositoryRef,
    pub hosts: HostRepositoryRef,
    pub snapshots: SnapshotRepositoryRef,
    pub details: VolumeDetailRepositoryRef,
}
