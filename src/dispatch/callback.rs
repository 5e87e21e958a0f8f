//! Completion callbacks and per-call async contexts

use crate::error::{Error, Result};
use tokio::sync::oneshot;
use tracing::warn;

enum Sink<O> {
    Channel(oneshot::Sender<O>),
    Function(Box<dyn FnOnce(O) + Send + 'static>),
}

/// Parent callback of an asynchronous driver call.
///
/// `complete` consumes the callback, so it can fire at most once.
pub struct CompletionCallback<O> {
    sink: Sink<O>,
}

impl<O: Send + 'static> CompletionCallback<O> {
    /// Callback whose outcome is awaited through the returned future
    pub fn channel(operation: &'static str) -> (Self, CompletionFuture<O>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sink: Sink::Channel(tx),
            },
            CompletionFuture { rx, operation },
        )
    }

    /// Callback that runs a closure with the outcome
    pub fn from_fn(f: impl FnOnce(O) + Send + 'static) -> Self {
        Self {
            sink: Sink::Function(Box::new(f)),
        }
    }

    pub fn complete(self, outcome: O) {
        match self.sink {
            Sink::Channel(tx) => {
                if tx.send(outcome).is_err() {
                    warn!("Completion receiver dropped before outcome arrived");
                }
            }
            Sink::Function(f) => f(outcome),
        }
    }
}

impl<O> std::fmt::Debug for CompletionCallback<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.sink {
            Sink::Channel(_) => "channel",
            Sink::Function(_) => "function",
        };
        f.debug_struct("CompletionCallback").field("sink", &kind).finish()
    }
}

/// Awaitable side of a channel callback
#[derive(Debug)]
pub struct CompletionFuture<O> {
    rx: oneshot::Receiver<O>,
    operation: &'static str,
}

impl<O> CompletionFuture<O> {
    /// Wait for the callback to fire
    pub async fn wait(self) -> Result<O> {
        self.rx.await.map_err(|_| Error::CallbackAbandoned {
            operation: self.operation.to_string(),
        })
    }
}

/// Strongly typed context created per asynchronous call.
///
/// Holds exactly one parent callback and the data the reply handler acts
/// on; consumed when the callback fires.
#[derive(Debug)]
pub struct AsyncContext<T, O> {
    data: T,
    callback: CompletionCallback<O>,
}

impl<T, O: Send + 'static> AsyncContext<T, O> {
    pub fn new(data: T, callback: CompletionCallback<O>) -> Self {
        Self { data, callback }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// Fire the parent callback and destroy the context
    pub fn complete(self, outcome: O) {
        self.callback.complete(outcome);
    }
}
