//! Endpoint selection for driver commands

use crate::domain::model::{PoolScope, StoragePool};
use crate::domain::ports::{EndpointSelector, HostRepositoryRef};
use crate::error::Result;
use crate::protocol::Endpoint;
use async_trait::async_trait;
use tracing::debug;

/// Selects the hosts that can reach a pool, host-scoped owners first
pub struct HostEndpointSelector {
    hosts: HostRepositoryRef,
}

impl HostEndpointSelector {
    pub fn new(hosts: HostRepositoryRef) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl EndpointSelector for HostEndpointSelector {
    async fn select(&self, pool: &StoragePool) -> Result<Vec<Endpoint>> {
        let mut hosts = self.hosts.hosts_for_pool(pool).await?;

        if let PoolScope::Host { host_id } = &pool.scope {
            hosts.sort_by_key(|h| &h.id != host_id);
        }

        debug!("Pool {} reachable from {} host(s)", pool.id, hosts.len());
        Ok(hosts.iter().map(Endpoint::for_host).collect())
    }
}

/// Fixed list of endpoints, regardless of pool
pub struct StaticEndpointSelector {
    endpoints: Vec<Endpoint>,
}

impl StaticEndpointSelector {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl EndpointSelector for StaticEndpointSelector {
    async fn select(&self, _pool: &StoragePool) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}
