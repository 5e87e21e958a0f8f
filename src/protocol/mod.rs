//! Command/Result Protocol
//!
//! Request/response envelope exchanged with remote host agents.

pub mod answer;
pub mod command;

pub use answer::*;
pub use command::*;

use crate::domain::model::{Host, HostId};
use serde::{Deserialize, Serialize};

/// Addressable host agent capable of receiving a command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host_id: HostId,
    pub address: String,
}

impl Endpoint {
    pub fn for_host(host: &Host) -> Self {
        Self {
            host_id: host.id.clone(),
            address: host.address.clone(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.host_id, self.address)
    }
}
