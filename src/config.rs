//! Configuration for the storage motion orchestrator
//!
//! Every section has sensible defaults; a YAML file may override any subset
//! of fields, and the binary layers CLI/env flags on top.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Agent Channel Configuration
// =============================================================================

/// How host agents are reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentChannelConfig {
    /// URL scheme for agent requests
    pub scheme: String,
    /// Agent listen port
    pub port: u16,
    /// Request path commands are posted to
    pub request_path: String,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-command timeout in seconds; migrations can run for a long time
    pub command_timeout_secs: u64,
}

impl Default for AgentChannelConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 8250,
            request_path: "/api/v1/commands".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: 3600,
        }
    }
}

impl AgentChannelConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Endpoint attempts made by the default driver before giving up
    pub send_attempts: usize,
    /// Request timeout for managed storage backends in seconds
    pub managed_timeout_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            send_attempts: 3,
            managed_timeout_secs: 60,
        }
    }
}

// =============================================================================
// Motion Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Refuse hosts whose hypervisor tags differ
    pub require_same_hypervisor: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            require_same_hypervisor: true,
        }
    }
}

// =============================================================================
// Root Configuration
// =============================================================================

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub agent: AgentChannelConfig,
    pub driver: DriverConfig,
    pub motion: MotionConfig,
}

impl OrchestratorConfig {
    /// Load from a YAML file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: OrchestratorConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.send_attempts == 0 {
            return Err(Error::Configuration(
                "driver.send_attempts must be at least 1".into(),
            ));
        }
        if self.agent.command_timeout_secs == 0 {
            return Err(Error::Configuration(
                "agent.command_timeout_secs must be positive".into(),
            ));
        }
        if self.driver.managed_timeout_secs == 0 {
            return Err(Error::Configuration(
                "driver.managed_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
