//! Default primary storage driver
//!
//! Sends volume commands to host agents that can reach the pool. A
//! synchronous send walks the candidate endpoints, stopping at the first
//! success answer.

use super::{CreatedVolume, PrimaryStorageDriver};
use crate::dispatch::{
    on_volume_created, on_volume_deleted, AsyncCompletionDispatcher, AsyncContext,
    CommandOutcome, CompletionCallback,
};
use crate::domain::model::{Host, SharedVolume, StoragePool, Volume};
use crate::domain::ports::{AgentChannelRef, EndpointSelectorRef};
use crate::error::{Error, Result};
use crate::protocol::{
    Answer, Command, CommandKind, CreateObjectCommand, CreateObjectReply, DeleteObjectCommand,
    Endpoint, RemoteReply, Reply, ReplyPayload, TransportError,
};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Driver for shared filesystem and block pools reached through host agents
#[derive(Clone)]
pub struct DefaultPrimaryDriver {
    channel: AgentChannelRef,
    dispatcher: AsyncCompletionDispatcher,
    selector: EndpointSelectorRef,
    send_attempts: usize,
}

impl DefaultPrimaryDriver {
    pub fn new(
        channel: AgentChannelRef,
        dispatcher: AsyncCompletionDispatcher,
        selector: EndpointSelectorRef,
        send_attempts: usize,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            selector,
            send_attempts: send_attempts.max(1),
        }
    }

    async fn endpoints(&self, pool: &StoragePool) -> Result<Vec<Endpoint>> {
        let endpoints = self.selector.select(pool).await?;
        if endpoints.is_empty() {
            return Err(Error::NoEndpoint {
                pool: pool.id.to_string(),
            });
        }
        Ok(endpoints)
    }

    /// Send `command` to the pool's endpoints until one answers with success.
    ///
    /// Candidates are tried in order, wrapping around when fewer endpoints
    /// than attempts exist. An explicit rejection from any endpoint is
    /// reported as such; only when nothing answered at all is the failure a
    /// communication error.
    pub async fn send_out_command(&self, pool: &StoragePool, command: Command) -> Result<Reply> {
        let endpoints = self.endpoints(pool).await?;
        let kind = command.kind();

        let mut rejection: Option<String> = None;
        let mut silence: Option<TransportError> = None;

        for attempt in 0..self.send_attempts {
            let endpoint = &endpoints[attempt % endpoints.len()];
            debug!(
                "Sending {} for pool {} to {} (attempt {}/{})",
                kind,
                pool.id,
                endpoint,
                attempt + 1,
                self.send_attempts
            );

            match self.channel.send(endpoint, command.clone()).await {
                Ok(Answer::Success(reply)) => return Ok(reply),
                Ok(Answer::Failure(detail)) => {
                    warn!("{} rejected by {}: {}", kind, endpoint, detail);
                    rejection = Some(detail);
                }
                Err(e) => {
                    warn!("{} got no answer from {}: {}", kind, endpoint, e);
                    silence = Some(e);
                }
            }
        }

        if let Some(detail) = rejection {
            return Err(Error::RemoteOperation {
                command: kind.to_string(),
                detail,
            });
        }

        let message = format!(
            "No endpoint answered {} for pool {} after {} attempt(s)",
            kind, pool.id, self.send_attempts
        );
        Err(match silence {
            Some(TransportError::TimedOut { after, .. }) => {
                Error::OperationTimedOut { message, after }
            }
            _ => Error::RemoteCommunication { message },
        })
    }

    fn create_command(volume: &Volume, pool: &StoragePool) -> Command {
        Command::CreateObject(CreateObjectCommand {
            volume: volume.into(),
            pool: pool.into(),
        })
    }

    fn delete_command(volume: &Volume, pool: &StoragePool) -> Command {
        Command::DeleteObject(DeleteObjectCommand {
            volume: volume.into(),
            pool: pool.into(),
        })
    }

    /// Dispatch to the first candidate endpoint once it is known
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
            match this.endpoints(&pool).await {
                Ok(endpoints) => {
                    let command = build(&volume.lock(), &pool);
                    let endpoint = endpoints[0].clone();
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
impl PrimaryStorageDriver for DefaultPrimaryDriver {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn create_volume(&self, volume: &Volume, pool: &StoragePool) -> Result<CreatedVolume> {
        info!("Creating volume {} on pool {}", volume.id, pool.id);

        let reply = self
            .send_out_command(pool, Self::create_command(volume, pool))
            .await?;
        let created =
            CreateObjectReply::from_reply(reply).ok_or_else(|| Error::UnexpectedReply {
                command: CommandKind::CreateObject.to_string(),
                expected: CreateObjectReply::NAME.into(),
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
        info!("Deleting volume {} from pool {}", volume.id, pool.id);

        match self
            .send_out_command(pool, Self::delete_command(volume, pool))
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::RemoteOperation { detail, .. }) => {
                warn!("Delete of volume {} refused: {}", volume.id, detail);
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
            Self::delete_command,
            on_volume_deleted,
        );
    }

    async fn grant_access(
        &self,
        volume: &Volume,
        _host: &Host,
        pool: &StoragePool,
    ) -> Result<String> {
        // Shared pools are reachable from every host in scope
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
