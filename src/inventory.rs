//! In-memory inventory
//!
//! Backs every persistence port with process-local maps. Used by the CLI,
//! which loads an inventory document from YAML, and by the tests.

use crate::domain::model::{
    DetailKey, Host, HostId, MigrationPlan, PoolId, PoolScope, Snapshot, StoragePool,
    VirtualMachineDescriptor, Volume, VolumeDetail, VolumeId,
};
use crate::domain::ports::{
    HostRepository, Repositories, SnapshotRepository, StoragePoolRepository,
    VolumeDetailRepository, VolumeRepository,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Documents
// =============================================================================

/// Serialized inventory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryDocument {
    pub hosts: Vec<Host>,
    pub pools: Vec<StoragePool>,
    pub volumes: Vec<Volume>,
    pub snapshots: Vec<Snapshot>,
}

/// One volume move as written in a request document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedMove {
    pub volume: VolumeId,
    pub destination: PoolId,
}

/// Migration request referring to inventory records by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub vm: VirtualMachineDescriptor,
    pub source_host: HostId,
    pub destination_host: HostId,
    pub moves: Vec<RequestedMove>,
}

impl MigrationRequest {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// A request with every reference resolved against the inventory
#[derive(Debug, Clone)]
pub struct ResolvedMigration {
    pub vm: VirtualMachineDescriptor,
    pub source: Host,
    pub destination: Host,
    pub plan: MigrationPlan,
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Default)]
pub struct Inventory {
    hosts: RwLock<BTreeMap<HostId, Host>>,
    pools: RwLock<BTreeMap<PoolId, StoragePool>>,
    volumes: RwLock<BTreeMap<VolumeId, Volume>>,
    snapshots: RwLock<Vec<Snapshot>>,
    details: RwLock<Vec<VolumeDetail>>,
}

fn not_found(kind: &str, name: impl std::fmt::Display) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: InventoryDocument) -> Self {
        let inventory = Self::new();
        for host in doc.hosts {
            inventory.insert_host(host);
        }
        for pool in doc.pools {
            inventory.insert_pool(pool);
        }
        for volume in doc.volumes {
            inventory.insert_volume(volume);
        }
        inventory.snapshots.write().extend(doc.snapshots);
        inventory
    }

    /// Load an inventory document from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let doc: InventoryDocument = serde_yaml::from_str(&raw)?;
        debug!(
            "Loaded inventory: {} host(s), {} pool(s), {} volume(s)",
            doc.hosts.len(),
            doc.pools.len(),
            doc.volumes.len()
        );
        Ok(Self::from_document(doc))
    }

    /// Repository handles backed by this inventory
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            volumes: self.clone(),
            pools: self.clone(),
            hosts: self.clone(),
            snapshots: self.clone(),
            details: self.clone(),
        }
    }

    pub fn insert_host(&self, host: Host) {
        self.hosts.write().insert(host.id.clone(), host);
    }

    pub fn insert_pool(&self, pool: StoragePool) {
        self.pools.write().insert(pool.id.clone(), pool);
    }

    pub fn insert_volume(&self, volume: Volume) {
        self.volumes.write().insert(volume.id.clone(), volume);
    }

    pub fn insert_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.write().push(snapshot);
    }

    pub fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.volumes.read().get(id).cloned()
    }

    pub fn managed_pools(&self) -> Vec<StoragePool> {
        self.pools
            .read()
            .values()
            .filter(|p| p.managed)
            .cloned()
            .collect()
    }

    /// Detail keys recorded for a volume, in order
    pub fn detail_keys(&self, id: &VolumeId) -> Vec<DetailKey> {
        self.details
            .read()
            .iter()
            .filter(|d| &d.volume_id == id)
            .map(|d| d.key)
            .collect()
    }

    /// Resolve a request's references into a runnable plan
    pub fn resolve(&self, request: &MigrationRequest) -> Result<ResolvedMigration> {
        let hosts = self.hosts.read();
        let source = hosts
            .get(&request.source_host)
            .cloned()
            .ok_or_else(|| not_found("Host", &request.source_host))?;
        let destination = hosts
            .get(&request.destination_host)
            .cloned()
            .ok_or_else(|| not_found("Host", &request.destination_host))?;

        let volumes = self.volumes.read();
        let pools = self.pools.read();
        let mut plan = MigrationPlan::new();
        for requested in &request.moves {
            let volume = volumes
                .get(&requested.volume)
                .cloned()
                .ok_or_else(|| not_found("Volume", &requested.volume))?;
            let pool = pools
                .get(&requested.destination)
                .cloned()
                .ok_or_else(|| not_found("StoragePool", &requested.destination))?;
            plan = plan.with_move(volume, pool);
        }

        Ok(ResolvedMigration {
            vm: request.vm.clone(),
            source,
            destination,
            plan,
        })
    }
}

// =============================================================================
// Repository Ports
// =============================================================================

#[async_trait]
impl VolumeRepository for Inventory {
    async fn get(&self, id: &VolumeId) -> Result<Option<Volume>> {
        Ok(self.volume(id))
    }

    async fn update(&self, volume: &Volume) -> Result<()> {
        let mut volumes = self.volumes.write();
        let stored = volumes
            .get_mut(&volume.id)
            .ok_or_else(|| not_found("Volume", &volume.id))?;
        *stored = volume.clone();
        Ok(())
    }

    async fn update_all(&self, batch: &[Volume]) -> Result<()> {
        let mut volumes = self.volumes.write();
        if let Some(missing) = batch.iter().find(|v| !volumes.contains_key(&v.id)) {
            return Err(not_found("Volume", &missing.id));
        }
        for volume in batch {
            volumes.insert(volume.id.clone(), volume.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl StoragePoolRepository for Inventory {
    async fn get(&self, id: &PoolId) -> Result<Option<StoragePool>> {
        Ok(self.pools.read().get(id).cloned())
    }

    async fn update_capacity(
        &self,
        id: &PoolId,
        capacity_bytes: u64,
        used_bytes: u64,
    ) -> Result<()> {
        let mut pools = self.pools.write();
        let pool = pools.get_mut(id).ok_or_else(|| not_found("StoragePool", id))?;
        pool.capacity_bytes = capacity_bytes;
        pool.used_bytes = used_bytes;
        Ok(())
    }

    async fn update_local_path(&self, id: &PoolId, local_path: &str) -> Result<()> {
        let mut pools = self.pools.write();
        let pool = pools.get_mut(id).ok_or_else(|| not_found("StoragePool", id))?;
        pool.local_path = Some(local_path.to_string());
        Ok(())
    }
}

#[async_trait]
impl HostRepository for Inventory {
    async fn get(&self, id: &HostId) -> Result<Option<Host>> {
        Ok(self.hosts.read().get(id).cloned())
    }

    async fn hosts_for_pool(&self, pool: &StoragePool) -> Result<Vec<Host>> {
        Ok(self
            .hosts
            .read()
            .values()
            .filter(|h| match &pool.scope {
                PoolScope::Zone => true,
                PoolScope::Cluster { cluster_id } => &h.cluster_id == cluster_id,
                PoolScope::Host { host_id } => &h.id == host_id,
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotRepository for Inventory {
    async fn list_by_volume(&self, volume_id: &VolumeId) -> Result<Vec<Snapshot>> {
        Ok(self
            .snapshots
            .read()
            .iter()
            .filter(|s| &s.volume_id == volume_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VolumeDetailRepository for Inventory {
    async fn add(&self, volume_id: &VolumeId, key: DetailKey, value: &str) -> Result<()> {
        self.details.write().push(VolumeDetail {
            volume_id: volume_id.clone(),
            key,
            value: value.to_string(),
            recorded_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn list(&self, volume_id: &VolumeId) -> Result<Vec<VolumeDetail>> {
        Ok(self
            .details
            .read()
            .iter()
            .filter(|d| &d.volume_id == volume_id)
            .cloned()
            .collect())
    }

    async fn remove(&self, volume_id: &VolumeId, key: DetailKey) -> Result<()> {
        self.details
            .write()
            .retain(|d| !(&d.volume_id == volume_id && d.key == key));
        Ok(())
    }
}
