//! Pool/host connection listener
//!
//! Keeps hosts attached to the shared pools they can reach and refreshes
//! the pool's capacity counters from what the host reports.

use crate::domain::model::{Host, StoragePool};
use crate::domain::ports::{AgentChannelRef, StoragePoolRepositoryRef};
use crate::error::Result;
use crate::protocol::{
    expect_payload, AckReply, Command, CommandKind, Endpoint, ModifyStoragePoolCommand,
    ModifyStoragePoolReply, PoolInfo,
};
use tracing::{debug, info};

pub struct PoolHostListener {
    channel: AgentChannelRef,
    pools: StoragePoolRepositoryRef,
}

impl PoolHostListener {
    pub fn new(channel: AgentChannelRef, pools: StoragePoolRepositoryRef) -> Self {
        Self { channel, pools }
    }

    /// Connect `host` to `pool` and record the capacity it reports.
    ///
    /// Managed pools are attached per volume, so nothing is sent for them
    /// and `None` is returned.
    pub async fn host_connected(
        &self,
        pool: &StoragePool,
        host: &Host,
    ) -> Result<Option<PoolInfo>> {
        if pool.managed {
            debug!("Skipping connect of managed pool {} on {}", pool.id, host.id);
            return Ok(None);
        }

        let command = Command::ModifyStoragePool(ModifyStoragePoolCommand {
            add: true,
            pool: pool.into(),
            storage_path: Some(pool.path.clone()),
        });
        let reply = self.channel.send(&Endpoint::for_host(host), command).await;
        let ModifyStoragePoolReply { pool_info } =
            expect_payload(CommandKind::ModifyStoragePool, reply, || {
                format!("Unable to connect pool {} to host {}", pool.id, host.id)
            })?;

        let used = pool_info
            .capacity_bytes
            .saturating_sub(pool_info.available_bytes);
        self.pools
            .update_capacity(&pool.id, pool_info.capacity_bytes, used)
            .await?;
        self.pools
            .update_local_path(&pool.id, &pool_info.local_path)
            .await?;

        info!(
            "Connected pool {} on {} at {} ({} of {} bytes available)",
            pool.id, host.id, pool_info.local_path, pool_info.available_bytes, pool_info.capacity_bytes
        );
        Ok(Some(pool_info))
    }

    /// Disconnect `host` from `pool`
    pub async fn host_disconnected(&self, pool: &StoragePool, host: &Host) -> Result<()> {
        if pool.managed {
            return Ok(());
        }

        let command = Command::ModifyStoragePool(ModifyStoragePoolCommand {
            add: false,
            pool: pool.into(),
            storage_path: None,
        });
        let reply = self.channel.send(&Endpoint::for_host(host), command).await;
        expect_payload::<AckReply>(CommandKind::ModifyStoragePool, reply, || {
            format!("Unable to disconnect pool {} from host {}", pool.id, host.id)
        })?;

        info!("Disconnected pool {} from {}", pool.id, host.id);
        Ok(())
    }
}
