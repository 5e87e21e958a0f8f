//! Commands sent to host agents
//!
//! Payload shapes only. How a command is framed on the wire is the agent
//! channel's business; the HTTP channel sends them as tagged JSON.

use crate::domain::model::{
    DetailMap, PoolId, PoolType, StoragePool, VirtualMachineDescriptor, Volume, VolumeFormat,
    VolumeId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Transfer Descriptors
// =============================================================================

/// Volume as described to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    pub format: VolumeFormat,
    pub pool_id: PoolId,
    pub path: Option<String>,
    pub locator: Option<String>,
}

impl From<&Volume> for VolumeDescriptor {
    fn from(volume: &Volume) -> Self {
        Self {
            id: volume.id.clone(),
            name: volume.name.clone(),
            size_bytes: volume.size_bytes,
            format: volume.format,
            pool_id: volume.pool_id.clone(),
            path: volume.path.clone(),
            locator: volume.locator.clone(),
        }
    }
}

/// Storage pool as described to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFilerDescriptor {
    pub pool_id: PoolId,
    pub pool_type: PoolType,
    pub host_address: String,
    pub port: u16,
    pub path: String,
}

impl From<&StoragePool> for StorageFilerDescriptor {
    fn from(pool: &StoragePool) -> Self {
        Self {
            pool_id: pool.id.clone(),
            pool_type: pool.pool_type,
            host_address: pool.host_address.clone(),
            port: pool.port,
            path: pool.path.clone(),
        }
    }
}

/// Where the destination host should place a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetLocator {
    /// Pre-existing shared filesystem
    Filer(StorageFilerDescriptor),
    /// Per-volume resource provisioned on a managed backend
    Managed { locator: String },
}

/// Volume paired with its destination filer (within-cluster protocol)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeFilerPair {
    pub volume: VolumeDescriptor,
    pub filer: StorageFilerDescriptor,
}

/// Volume paired with its destination target (cross-cluster protocol)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTarget {
    pub volume: VolumeDescriptor,
    pub target: TargetLocator,
}

/// Handle assigned by the destination host to a received volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTargetHandle {
    pub volume_id: VolumeId,
    pub handle: String,
}

/// Disk to create on a legacy pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskProfile {
    pub volume_id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    pub format: VolumeFormat,
}

impl From<&Volume> for DiskProfile {
    fn from(volume: &Volume) -> Self {
        Self {
            volume_id: volume.id.clone(),
            name: volume.name.clone(),
            size_bytes: volume.size_bytes,
            format: volume.format,
        }
    }
}

// =============================================================================
// Managed Storage Pool Detail Keys
// =============================================================================

/// Target name of the managed volume (e.g. iSCSI IQN)
pub const DETAIL_TARGET_NAME: &str = "managed_store_target";
/// Storage network address of the managed backend
pub const DETAIL_STORAGE_HOST: &str = "storage_host";
/// Storage network port of the managed backend
pub const DETAIL_STORAGE_PORT: &str = "storage_port";

/// Build the detail map identifying a managed volume on its backend
pub fn managed_target_details(locator: &str, pool: &StoragePool) -> DetailMap {
    let mut details = BTreeMap::new();
    details.insert(DETAIL_TARGET_NAME.to_string(), locator.to_string());
    details.insert(DETAIL_STORAGE_HOST.to_string(), pool.host_address.clone());
    details.insert(DETAIL_STORAGE_PORT.to_string(), pool.port.to_string());
    details
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithinClusterMigrationCommand {
    pub vm: VirtualMachineDescriptor,
    pub volumes: Vec<VolumeFilerPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveMigrationCommand {
    pub vm: VirtualMachineDescriptor,
    pub volumes: Vec<VolumeTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMigrationCommand {
    pub vm: VirtualMachineDescriptor,
    pub target_handles: Vec<VolumeTargetHandle>,
    pub nic_networks: BTreeMap<String, String>,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteMigrationCommand {
    pub vm: VirtualMachineDescriptor,
}

/// Attach or detach a managed volume's storage association on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedStoragePoolCommand {
    pub pool: StorageFilerDescriptor,
    pub details: DetailMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyStoragePoolCommand {
    /// `true` to connect the pool to the host, `false` to disconnect it
    pub add: bool,
    pub pool: StorageFilerDescriptor,
    pub storage_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateObjectCommand {
    pub volume: VolumeDescriptor,
    pub pool: StorageFilerDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteObjectCommand {
    pub volume: VolumeDescriptor,
    pub pool: StorageFilerDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeCommand {
    pub disk: DiskProfile,
    pub pool: StorageFilerDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyVolumeCommand {
    pub volume: VolumeDescriptor,
    pub pool: StorageFilerDescriptor,
}

/// Every command a host agent understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    WithinClusterMigration(WithinClusterMigrationCommand),
    ReceiveMigration(ReceiveMigrationCommand),
    SendMigration(SendMigrationCommand),
    CompleteMigration(CompleteMigrationCommand),
    CreateManagedStoragePool(ManagedStoragePoolCommand),
    DeleteManagedStoragePool(ManagedStoragePoolCommand),
    ModifyStoragePool(ModifyStoragePoolCommand),
    CreateObject(CreateObjectCommand),
    DeleteObject(DeleteObjectCommand),
    /// Legacy hypervisor-specific disk creation
    CreateVolume(CreateVolumeCommand),
    /// Legacy hypervisor-specific disk removal
    DestroyVolume(DestroyVolumeCommand),
}

/// Payload-free discriminant of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    WithinClusterMigration,
    ReceiveMigration,
    SendMigration,
    CompleteMigration,
    CreateManagedStoragePool,
    DeleteManagedStoragePool,
    ModifyStoragePool,
    CreateObject,
    DeleteObject,
    CreateVolume,
    DestroyVolume,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::WithinClusterMigration => "within_cluster_migration",
            CommandKind::ReceiveMigration => "receive_migration",
            CommandKind::SendMigration => "send_migration",
            CommandKind::CompleteMigration => "complete_migration",
            CommandKind::CreateManagedStoragePool => "create_managed_storage_pool",
            CommandKind::DeleteManagedStoragePool => "delete_managed_storage_pool",
            CommandKind::ModifyStoragePool => "modify_storage_pool",
            CommandKind::CreateObject => "create_object",
            CommandKind::DeleteObject => "delete_object",
            CommandKind::CreateVolume => "create_volume",
            CommandKind::DestroyVolume => "destroy_volume",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::WithinClusterMigration(_) => CommandKind::WithinClusterMigration,
            Command::ReceiveMigration(_) => CommandKind::ReceiveMigration,
            Command::SendMigration(_) => CommandKind::SendMigration,
            Command::CompleteMigration(_) => CommandKind::CompleteMigration,
            Command::CreateManagedStoragePool(_) => CommandKind::CreateManagedStoragePool,
            Command::DeleteManagedStoragePool(_) => CommandKind::DeleteManagedStoragePool,
            Command::ModifyStoragePool(_) => CommandKind::ModifyStoragePool,
            Command::CreateObject(_) => CommandKind::CreateObject,
            Command::DeleteObject(_) => CommandKind::DeleteObject,
            Command::CreateVolume(_) => CommandKind::CreateVolume,
            Command::DestroyVolume(_) => CommandKind::DestroyVolume,
        }
    }
}
