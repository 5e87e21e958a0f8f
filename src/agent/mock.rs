//! Scripted agent channel for testing and development.

use crate::domain::model::HostId;
use crate::domain::ports::AgentChannel;
use crate::protocol::{Command, CommandKind, Endpoint, RemoteReply, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// A command as it was handed to the channel
#[derive(Debug, Clone)]
pub struct SentCommand {
    pub endpoint: Endpoint,
    pub command: Command,
}

#[derive(Default)]
struct MockState {
    /// One-shot replies, consumed in order
    queued: HashMap<CommandKind, VecDeque<RemoteReply>>,
    /// Reply used once the queue for a kind is empty
    fallback: HashMap<CommandKind, RemoteReply>,
    sent: Vec<SentCommand>,
}

/// Mock agent channel.
///
/// Replies are scripted per command kind and every command sent is
/// recorded in order, so tests can assert the exact protocol shape.
/// Commands with no scripted reply are treated as unreachable.
#[derive(Clone, Default)]
pub struct MockAgentChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockAgentChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next command of `kind`
    pub fn reply(&self, kind: CommandKind, reply: RemoteReply) -> &Self {
        self.state
            .lock()
            .queued
            .entry(kind)
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used for every command of `kind` once its queue is drained
    pub fn always(&self, kind: CommandKind, reply: RemoteReply) -> &Self {
        self.state.lock().fallback.insert(kind, reply);
        self
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.state.lock().sent.clone()
    }

    pub fn sent_kinds(&self) -> Vec<CommandKind> {
        self.state
            .lock()
            .sent
            .iter()
            .map(|s| s.command.kind())
            .collect()
    }

    /// Kinds of the commands sent to a host, in order
    pub fn sent_to(&self, host_id: &HostId) -> Vec<CommandKind> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|s| &s.endpoint.host_id == host_id)
            .map(|s| s.command.kind())
            .collect()
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|s| s.command.kind() == kind)
            .count()
    }
}

#[async_trait]
impl AgentChannel for MockAgentChannel {
    async fn send(&self, endpoint: &Endpoint, command: Command) -> RemoteReply {
        let kind = command.kind();
        debug!("Mock agent {} received {}", endpoint, kind);

        let mut state = self.state.lock();
        state.sent.push(SentCommand {
            endpoint: endpoint.clone(),
            command,
        });

        if let Some(reply) = state.queued.get_mut(&kind).and_then(|q| q.pop_front()) {
            return reply;
        }
        match state.fallback.get(&kind) {
            Some(reply) => reply.clone(),
            None => Err(TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: format!("no scripted reply for {}", kind),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AckReply, Answer, CompleteMigrationCommand};
    use crate::testing::{host, vm};

    #[tokio::test]
    async fn test_queued_then_fallback_then_unreachable() {
        let channel = MockAgentChannel::new();
        channel
            .reply(CommandKind::CompleteMigration, Ok(Answer::failure("first")))
            .always(
                CommandKind::CompleteMigration,
                Ok(Answer::success(AckReply::default())),
            );

        let endpoint = Endpoint::for_host(&host("h1", "c1"));
        let cmd = Command::CompleteMigration(CompleteMigrationCommand { vm: vm("vm-1") });

        let first = channel.send(&endpoint, cmd.clone()).await.unwrap();
        assert_eq!(first.detail(), Some("first"));
        let second = channel.send(&endpoint, cmd.clone()).await.unwrap();
        assert!(second.is_success());

        let other = Endpoint::for_host(&host("h2", "c1"));
        channel.state.lock().fallback.clear();
        assert!(channel.send(&other, cmd).await.is_err());

        assert_eq!(channel.count(CommandKind::CompleteMigration), 3);
        assert_eq!(channel.sent_to(&HostId::new("h2")).len(), 1);
    }
}
