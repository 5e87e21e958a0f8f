//! Storage Motion
//!
//! Live migration of a VM together with its volumes. Hosts sharing a cluster
//! use a single round trip; otherwise the destination receives, the source
//! sends and the destination completes, with managed volumes provisioned
//! before and torn down after.

pub mod state;
pub mod strategy;

pub use state::*;
pub use strategy::*;

use crate::domain::model::{PoolId, VmId, VolumeId};
use serde::{Deserialize, Serialize};

/// Protocol chosen for a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationProtocol {
    WithinCluster,
    CrossCluster,
}

impl MigrationProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationProtocol::WithinCluster => "within_cluster",
            MigrationProtocol::CrossCluster => "cross_cluster",
        }
    }
}

impl std::fmt::Display for MigrationProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a volume ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRelocation {
    pub volume_id: VolumeId,
    pub previous_pool: PoolId,
    pub new_pool: PoolId,
    pub path: String,
}

/// Summary of a successful migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub vm_id: VmId,
    pub protocol: MigrationProtocol,
    pub relocations: Vec<VolumeRelocation>,
    /// States visited, in order
    pub states: Vec<MotionState>,
}
