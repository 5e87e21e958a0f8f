//! Storage Motion Orchestrator
//!
//! Live migration of a running VM together with its attached block volumes,
//! between hosts and across storage pools.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      Storage Motion Strategy                         │
//! │   within-cluster: one round trip                                     │
//! │   cross-cluster:  provision → receive → send → complete → cleanup    │
//! ├──────────────────────────────┬───────────────────────────────────────┤
//! │  Async Completion Dispatcher │       Primary Storage Drivers         │
//! │  (one callback per command)  │   default │ legacy │ managed          │
//! ├──────────────────────────────┴───────────────────────────────────────┤
//! │                  Agent Channel (HTTP / scripted mock)                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │         Persistence ports (volumes, pools, hosts, snapshots)         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`motion`]: migration state machine and strategy
//! - [`dispatch`]: async command dispatch with completion callbacks
//! - [`driver`]: primary storage drivers and the registry choosing them
//! - [`protocol`]: commands, replies and transport failures
//! - [`agent`]: agent channel adapters
//! - [`inventory`]: in-memory persistence backing the CLI and tests
//! - [`domain`]: core records and ports
//! - [`error`]: error types and handling

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod driver;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod motion;
pub mod protocol;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use agent::{HttpAgentChannel, MockAgentChannel};

pub use config::{AgentChannelConfig, DriverConfig, MotionConfig, OrchestratorConfig};

pub use dispatch::{AsyncCompletionDispatcher, AsyncContext, CommandOutcome, CompletionCallback};

pub use domain::model::{
    Host, MigrationPlan, StoragePool, VirtualMachineDescriptor, Volume,
};
pub use domain::ports::{AgentChannel, Repositories};

pub use driver::{
    DriverRegistry, HttpManagedStorageClient, ManagedPrimaryDriver, PoolHostListener,
    PrimaryStorageDriver,
};

pub use error::{Error, ErrorAction, Result};

pub use inventory::{Inventory, MigrationRequest};

pub use metrics::MotionMetrics;

pub use motion::{MigrationReport, MotionState, StorageMotionStrategy, StrategyPriority};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
