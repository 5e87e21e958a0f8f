//! Domain Model - Volumes, pools, hosts and the VM snapshot handed to a migration
//!
//! These records are owned by the persistence layer. The motion strategy
//! reads them and writes back only pool assignment and path fields after a
//! positive terminal result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a volume
    VolumeId
);
id_type!(
    /// Unique identifier for a storage pool
    PoolId
);
id_type!(
    /// Unique identifier for a host
    HostId
);
id_type!(
    /// Unique identifier for a cluster
    ClusterId
);
id_type!(
    /// Unique identifier for a pod (group of clusters)
    PodId
);
id_type!(
    /// Unique identifier for a virtual machine
    VmId
);

// =============================================================================
// Volume
// =============================================================================

/// On-disk format of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Raw,
    Qcow2,
    Vhd,
    Ova,
}

impl std::fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeFormat::Raw => write!(f, "raw"),
            VolumeFormat::Qcow2 => write!(f, "qcow2"),
            VolumeFormat::Vhd => write!(f, "vhd"),
            VolumeFormat::Ova => write!(f, "ova"),
        }
    }
}

/// A block volume attached (or attachable) to a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    pub format: VolumeFormat,
    /// Pool the volume currently belongs to
    pub pool_id: PoolId,
    /// Pool the volume belonged to before its last migration
    #[serde(default)]
    pub last_pool_id: Option<PoolId>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub pod_id: Option<PodId>,
    /// Lives on a managed storage pool
    #[serde(default)]
    pub managed: bool,
    /// Backend locator for managed volumes (e.g. an iSCSI target name)
    #[serde(default)]
    pub locator: Option<String>,
}

impl Volume {
    /// Copy of this volume as it would be provisioned on another pool
    pub fn placed_on(&self, pool: &StoragePool) -> Volume {
        Volume {
            pool_id: pool.id.clone(),
            last_pool_id: Some(self.pool_id.clone()),
            managed: pool.managed,
            locator: None,
            ..self.clone()
        }
    }
}

/// Volume reference shared between a driver call and its completion handler
pub type SharedVolume = Arc<parking_lot::Mutex<Volume>>;

/// Wrap a volume for an asynchronous driver call
pub fn shared(volume: Volume) -> SharedVolume {
    Arc::new(parking_lot::Mutex::new(volume))
}

// =============================================================================
// Storage Pool
// =============================================================================

/// Storage pool types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    NetworkFilesystem,
    SharedMountPoint,
    Iscsi,
    Rbd,
    /// Host-local directory
    Filesystem,
    /// Host-local LVM volume group
    Lvm,
}

impl std::fmt::Display for PoolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolType::NetworkFilesystem => write!(f, "nfs"),
            PoolType::SharedMountPoint => write!(f, "shared_mount_point"),
            PoolType::Iscsi => write!(f, "iscsi"),
            PoolType::Rbd => write!(f, "rbd"),
            PoolType::Filesystem => write!(f, "filesystem"),
            PoolType::Lvm => write!(f, "lvm"),
        }
    }
}

/// Visibility of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum PoolScope {
    Zone,
    Cluster { cluster_id: ClusterId },
    Host { host_id: HostId },
}

/// A primary storage pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: PoolId,
    pub name: String,
    pub pool_type: PoolType,
    /// Provisions per-volume resources on demand
    #[serde(default)]
    pub managed: bool,
    pub scope: PoolScope,
    #[serde(default)]
    pub pod_id: Option<PodId>,
    /// Storage network address (managed backends, NFS servers)
    pub host_address: String,
    #[serde(default)]
    pub port: u16,
    /// Export path or mount point
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
    /// Mount point reported by the last host that connected the pool
    #[serde(default)]
    pub local_path: Option<String>,
}

impl StoragePool {
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

// =============================================================================
// Host
// =============================================================================

/// Hypervisor capability tag of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorType {
    Kvm,
    XenServer,
    Vmware,
    Simulator,
}

impl HypervisorType {
    /// Hypervisors able to live-migrate a VM together with its storage
    pub fn supports_storage_motion(&self) -> bool {
        matches!(
            self,
            HypervisorType::Kvm | HypervisorType::XenServer | HypervisorType::Simulator
        )
    }
}

impl std::fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorType::Kvm => write!(f, "kvm"),
            HypervisorType::XenServer => write!(f, "xenserver"),
            HypervisorType::Vmware => write!(f, "vmware"),
            HypervisorType::Simulator => write!(f, "simulator"),
        }
    }
}

/// A virtualization host running an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub cluster_id: ClusterId,
    pub hypervisor: HypervisorType,
    /// Agent address (hostname or IP)
    pub address: String,
    /// Storage initiator name used when granting volume access
    #[serde(default)]
    pub initiator: Option<String>,
}

impl Host {
    pub fn shares_cluster_with(&self, other: &Host) -> bool {
        self.cluster_id == other.cluster_id
    }
}

// =============================================================================
// Virtual Machine Descriptor
// =============================================================================

/// NIC of a VM as seen by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDescriptor {
    pub uuid: String,
    pub mac: String,
    pub network: String,
}

/// Disk of a VM as seen by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub volume_id: VolumeId,
    pub device_id: u32,
    #[serde(default)]
    pub path: Option<String>,
}

/// Immutable snapshot of a VM handed to the migration protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineDescriptor {
    pub id: VmId,
    pub instance_name: String,
    #[serde(default)]
    pub nics: Vec<NicDescriptor>,
    #[serde(default)]
    pub disks: Vec<DiskDescriptor>,
}

// =============================================================================
// Migration Plan
// =============================================================================

/// One volume and the pool it should end up on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMove {
    pub volume: Volume,
    pub destination: StoragePool,
}

/// Volume to destination pool mapping supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub moves: Vec<PlannedMove>,
}

impl MigrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_move(mut self, volume: Volume, destination: StoragePool) -> Self {
        self.moves.push(PlannedMove {
            volume,
            destination,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Lifecycle state of a volume snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Allocated,
    Creating,
    BackingUp,
    BackedUp,
    Error,
    Destroying,
    Destroyed,
}

/// A volume snapshot record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: VolumeId,
    pub state: SnapshotState,
}

impl Snapshot {
    pub fn is_live(&self) -> bool {
        self.state != SnapshotState::Destroyed
    }
}

// =============================================================================
// Audit Details
// =============================================================================

/// Marker keys recorded against a volume as lifecycle steps are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailKey {
    PreCreate,
    PreGrantAccess,
    PostRevokeAccess,
    PostDelete,
    DeleteFailure,
    ResolvedLocator,
}

impl DetailKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailKey::PreCreate => "basicCreate",
            DetailKey::PreGrantAccess => "basicGrantAccess",
            DetailKey::PostRevokeAccess => "basicRevokeAccess",
            DetailKey::PostDelete => "basicDelete",
            DetailKey::DeleteFailure => "basicDeleteFailure",
            DetailKey::ResolvedLocator => "managedStoreTarget",
        }
    }
}

impl std::fmt::Display for DetailKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit detail attached to a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDetail {
    pub volume_id: VolumeId,
    pub key: DetailKey,
    pub value: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Detail map carried by managed storage pool commands
pub type DetailMap = BTreeMap<String, String>;
