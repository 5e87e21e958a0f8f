//! Legacy primary storage driver
//!
//! Host-local pools (directories, LVM volume groups) are served by the one
//! host that owns them. Commands go straight to that host as
//! hypervisor-specific disk operations, with no endpoint retry loop.

use super::{CreatedVolume, PrimaryStorageDriver};
use crate::dispatch::{
    on_volume_created, on_volume_deleted, AsyncCompletionDispatcher, AsyncContext,
    CommandOutcome, CompletionCallback,
};
use crate::domain::model::{Host, SharedVolume, StoragePool, Volume};
use crate::domain::ports::{AgentChannelRef, EndpointSelectorRef};
use crate::error::{Error, Result};
use crate::protocol::{
    expect_payload, AckReply, Command, CommandKind, CreateObjectReply, CreateVolumeCommand,
    DestroyVolumeCommand, Endpoint, RemoteReply,
};
use async_trait::async_trait;
use tracing::{info, warn};

/// Direct driver for host-local pools
#[derive(Clone)]
pub struct LegacyPrimaryDriver {
    channel: AgentChannelRef,
    dispatcher: AsyncCompletionDispatcher,
    selector: EndpointSelectorRef,
}

impl LegacyPrimaryDriver {
    pub fn new(
        channel: AgentChannelRef,
        dispatcher: AsyncCompletionDispatcher,
        selector: EndpointSelectorRef,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            selector,
        }
    }

    /// The single host serving the pool
    async fn pool_endpoint(&self, pool: &StoragePool) -> Result<Endpoint> {
        self.selector
            .select(pool)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoEndpoint {
                pool: pool.id.to_string(),
            })
    }

    fn create_command(volume: &Volume, pool: &StoragePool) -> Command {
        Command::CreateVolume(CreateVolumeCommand {
            disk: volume.into(),
            pool: pool.into(),
        })
    }

    fn destroy_command(volume: &Volume, pool: &StoragePool) -> Command {
        Command::DestroyVolume(DestroyVolumeCommand {
            volume: volume.into(),
            pool: pool.into(),
        })
    }

    fn dispatch_volume_command(
        &self,
        volume: SharedVolume,
        pool: StoragePool,
        callback: CompletionCallback<CommandOutcome>,
        build: fn(&Volume, &StoragePool) -> Command,
        handler: fn(RemoteReply, &SharedVolume) -> CommandOutcome,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.pool_endpoint(&pool).await {
                Ok(endpoint) => {
                    let command = build(&volume.lock(), &pool);
                    this.dispatcher.dispatch(
                        command,
                        endpoint,
                        AsyncContext::new(volume, callback),
                        handler,
                    );
                }
                Err(e) => callback.complete(CommandOutcome::failed(e.to_string())),
            }
        });
    }
}

#[async_trait]
impl PrimaryStorageDriver for LegacyPrimaryDriver {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn create_volume(&self, volume: &Volume, pool: &StoragePool) -> Result<CreatedVolume> {
        let endpoint = self.pool_endpoint(pool).await?;
        info!(
            "Creating {} disk {} on local pool {} via {}",
            volume.format, volume.id, pool.id, endpoint
        );

        let reply = self
            .channel
            .send(&endpoint, Self::create_command(volume, pool))
            .await;
        let created: CreateObjectReply = expect_payload(CommandKind::CreateVolume, reply, || {
            format!("Unable to create volume {} on host {}", volume.id, endpoint.host_id)
        })?;

        Ok(CreatedVolume {
            size_bytes: created.size_bytes.unwrap_or(volume.size_bytes),
            path: created.path,
            locator: created.locator,
        })
    }

    fn create_volume_async(
        &self,
        volume: SharedVolume,
        pool: StoragePool,
        callback: CompletionCallback<CommandOutcome>,
    ) {
        self.dispatch_volume_command(
            volume,
            pool,
            callback,
            Self::create_command,
            on_volume_created,
        );
    }

    async fn delete_volume(&self, volume: &Volume, pool: &StoragePool) -> Result<bool> {
        let endpoint = self.pool_endpoint(pool).await?;
        info!("Destroying disk {} on local pool {}", volume.id, pool.id);

        let reply = self
            .channel
            .send(&endpoint, Self::destroy_command(volume, pool))
            .await;
        match expect_payload::<AckReply>(CommandKind::DestroyVolume, reply, || {
            format!("Unable to destroy volume {} on host {}", volume.id, endpoint.host_id)
        }) {
            Ok(_) => Ok(true),
            Err(Error::RemoteOperation { detail, .. }) => {
                warn!("Destroy of volume {} refused: {}", volume.id, detail);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn delete_volume_async(
        &self,
        volume: SharedVolume,
        pool: StoragePool,
        callback: CompletionCallback<CommandOutcome>,
    ) {
        self.dispatch_volume_command(
            volume,
            pool,
            callback,
            Self::destroy_command,
            on_volume_deleted,
        );
    }

    async fn grant_access(
        &self,
        volume: &Volume,
        host: &Host,
        pool: &StoragePool,
    ) -> Result<String> {
        let owner = self.pool_endpoint(pool).await?;
        if owner.host_id != host.id {
            return Err(Error::Configuration(format!(
                "local pool {} is only reachable from {}, not {}",
                pool.id, owner.host_id, host.id
            )));
        }
        Ok(volume
            .path
            .clone()
            .unwrap_or_else(|| format!("{}/{}", pool.path, volume.id)))
    }

    async fn revoke_access(
        &self,
        _volume: &Volume,
        _host: &Host,
        _pool: &StoragePool,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn capacity(&self, pool: &StoragePool) -> Result<u64> {
        Ok(pool.capacity_bytes)
    }

    async fn available_capacity(&self, pool: &StoragePool) -> Result<u64> {
        Ok(pool.available_bytes())
    }
}
