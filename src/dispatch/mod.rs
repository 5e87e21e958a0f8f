//! Async Completion Dispatcher
//!
//! Issues a command to a host agent without blocking the caller and runs a
//! reply handler once the outcome is known. The handler turns the reply
//! into an outcome; the dispatcher then fires the parent callback carried by
//! the context, exactly once. No retries happen here.

pub mod callback;

pub use callback::*;

use crate::domain::model::SharedVolume;
use crate::domain::ports::AgentChannelRef;
use crate::error::Result;
use crate::protocol::{Answer, Command, Endpoint, RemoteReply, Reply};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// =============================================================================
// Command Outcome
// =============================================================================

/// Final outcome of an asynchronous driver operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Completed { path: Option<String> },
    Failed { detail: String },
}

impl CommandOutcome {
    pub fn completed() -> Self {
        CommandOutcome::Completed { path: None }
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        CommandOutcome::Completed {
            path: Some(path.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        CommandOutcome::Failed {
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Completed { .. })
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            CommandOutcome::Completed { path } => path.as_deref(),
            CommandOutcome::Failed { .. } => None,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            CommandOutcome::Completed { .. } => None,
            CommandOutcome::Failed { detail } => Some(detail),
        }
    }
}

/// Context of a volume create/delete call
pub type VolumeContext = AsyncContext<SharedVolume, CommandOutcome>;

// =============================================================================
// Dispatcher
// =============================================================================

/// Dispatches commands asynchronously and completes their contexts
#[derive(Clone)]
pub struct AsyncCompletionDispatcher {
    channel: AgentChannelRef,
}

impl AsyncCompletionDispatcher {
    pub fn new(channel: AgentChannelRef) -> Self {
        Self { channel }
    }

    /// Send `command` to `endpoint` and return immediately.
    ///
    /// `handler` receives the reply and the context data and produces the
    /// outcome that completes the context's parent callback.
    pub fn dispatch<T, O, H>(
        &self,
        command: Command,
        endpoint: Endpoint,
        context: AsyncContext<T, O>,
        handler: H,
    ) where
        T: Send + 'static,
        O: Send + 'static,
        H: FnOnce(RemoteReply, &T) -> O + Send + 'static,
    {
        let kind = command.kind();
        debug!("Dispatching {} to {}", kind, endpoint);

        self.channel.clone().send_async(
            endpoint,
            command,
            Box::new(move |reply| {
                let outcome = handler(reply, context.data());
                debug!("Completing context for {}", kind);
                context.complete(outcome);
            }),
        );
    }

    /// Dispatch and wait for the outcome on the current task
    pub async fn dispatch_and_wait<T, O, H>(
        &self,
        command: Command,
        endpoint: Endpoint,
        data: T,
        handler: H,
    ) -> Result<O>
    where
        T: Send + 'static,
        O: Send + 'static,
        H: FnOnce(RemoteReply, &T) -> O + Send + 'static,
    {
        let (callback, completion) = CompletionCallback::channel(command.kind().as_str());
        self.dispatch(command, endpoint, AsyncContext::new(data, callback), handler);
        completion.wait().await
    }
}

// =============================================================================
// Volume Reply Handlers
// =============================================================================

/// Handle the reply to a volume create: copy the remote-assigned path and
/// locator into the volume on success, record the detail on failure
pub fn on_volume_created(reply: RemoteReply, volume: &SharedVolume) -> CommandOutcome {
    match reply {
        Ok(Answer::Success(Reply::CreateObject(created))) => {
            let mut volume = volume.lock();
            debug!("Volume {} created at {}", volume.id, created.path);
            volume.path = Some(created.path.clone());
            if let Some(locator) = created.locator {
                volume.locator = Some(locator);
            }
            if let Some(size) = created.size_bytes {
                volume.size_bytes = size;
            }
            CommandOutcome::with_path(created.path)
        }
        Ok(Answer::Success(other)) => {
            warn!("Unexpected reply to volume create: {:?}", other);
            CommandOutcome::failed("unexpected reply to volume create")
        }
        Ok(Answer::Failure(detail)) => {
            warn!("Volume {} create rejected: {}", volume.lock().id, detail);
            CommandOutcome::failed(detail)
        }
        Err(e) => CommandOutcome::failed(e.to_string()),
    }
}

/// Handle the reply to a volume delete
pub fn on_volume_deleted(reply: RemoteReply, volume: &SharedVolume) -> CommandOutcome {
    match reply {
        Ok(Answer::Success(_)) => {
            let mut volume = volume.lock();
            debug!("Volume {} deleted", volume.id);
            volume.path = None;
            CommandOutcome::completed()
        }
        Ok(Answer::Failure(detail)) => {
            warn!("Volume {} delete rejected: {}", volume.lock().id, detail);
            CommandOutcome::failed(detail)
        }
        Err(e) => CommandOutcome::failed(e.to_string()),
    }
}
