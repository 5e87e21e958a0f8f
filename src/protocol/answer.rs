//! Results returned by host agents
//!
//! A remote exchange ends in one of three ways: an explicit success with a
//! payload, an explicit failure with detail text, or no answer at all. The
//! first two are [`Answer`] variants; the third is a [`TransportError`].

use crate::domain::model::VolumeId;
use crate::protocol::command::{CommandKind, VolumeTargetHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Reply Payloads
// =============================================================================

/// Final location of a volume after a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePath {
    pub volume_id: VolumeId,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithinClusterMigrationReply {
    pub volume_paths: Vec<VolumePath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveMigrationReply {
    /// Correlates the later send phase with this receive
    pub token: String,
    pub target_handles: Vec<VolumeTargetHandle>,
    /// NIC uuid to destination network
    pub nic_networks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMigrationReply {
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteMigrationReply {
    pub volume_paths: Vec<VolumePath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedStoragePoolReply {
    /// Host-side handle of the created association, if any
    pub association: Option<String>,
}

/// Pool state as reported by a host after connecting to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub capacity_bytes: u64,
    pub available_bytes: u64,
    pub local_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyStoragePoolReply {
    pub pool_info: PoolInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateObjectReply {
    /// Remote-assigned path or locator of the new volume
    pub path: String,
    pub size_bytes: Option<u64>,
    /// Backend locator, when the store addresses volumes by target name
    #[serde(default)]
    pub locator: Option<String>,
}

/// Acknowledgement of a command with no payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckReply {
    pub detail: Option<String>,
}

/// Every successful reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "payload", rename_all = "snake_case")]
pub enum Reply {
    WithinClusterMigration(WithinClusterMigrationReply),
    ReceiveMigration(ReceiveMigrationReply),
    SendMigration(SendMigrationReply),
    CompleteMigration(CompleteMigrationReply),
    ManagedStoragePool(ManagedStoragePoolReply),
    ModifyStoragePool(ModifyStoragePoolReply),
    CreateObject(CreateObjectReply),
    Ack(AckReply),
}

/// A reply payload type that can be extracted from [`Reply`]
pub trait ReplyPayload: Sized {
    /// Variant name used in error messages
    const NAME: &'static str;

    fn from_reply(reply: Reply) -> Option<Self>;
}

macro_rules! reply_payload {
    ($($variant:ident => $payload:ty),* $(,)?) => {
        $(
            impl ReplyPayload for $payload {
                const NAME: &'static str = stringify!($variant);

                fn from_reply(reply: Reply) -> Option<Self> {
                    match reply {
                        Reply::$variant(payload) => Some(payload),
                        _ => None,
                    }
                }
            }

            impl From<$payload> for Reply {
                fn from(payload: $payload) -> Self {
                    Reply::$variant(payload)
                }
            }
        )*
    };
}

reply_payload! {
    WithinClusterMigration => WithinClusterMigrationReply,
    ReceiveMigration => ReceiveMigrationReply,
    SendMigration => SendMigrationReply,
    CompleteMigration => CompleteMigrationReply,
    ManagedStoragePool => ManagedStoragePoolReply,
    ModifyStoragePool => ModifyStoragePoolReply,
    CreateObject => CreateObjectReply,
    Ack => AckReply,
}

// =============================================================================
// Answer
// =============================================================================

/// Explicit answer from a host agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "body", rename_all = "snake_case")]
pub enum Answer {
    Success(Reply),
    Failure(String),
}

impl Answer {
    pub fn success(payload: impl Into<Reply>) -> Self {
        Answer::Success(payload.into())
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Answer::Failure(detail.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Answer::Success(_))
    }

    /// Failure detail, if this answer is an explicit failure
    pub fn detail(&self) -> Option<&str> {
        match self {
            Answer::Success(_) => None,
            Answer::Failure(detail) => Some(detail),
        }
    }
}

// =============================================================================
// Transport Failures
// =============================================================================

/// No answer was received for a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("endpoint {endpoint} did not answer within {after:?}")]
    TimedOut { endpoint: String, after: Duration },
}

/// Outcome of a single remote exchange
pub type RemoteReply = std::result::Result<Answer, TransportError>;

/// Classified outcome of a remote exchange for a specific payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange<P> {
    Success(P),
    /// Explicit failure with remote detail text
    Rejected(String),
    /// Success answer carrying a payload of the wrong kind
    Mismatched { expected: &'static str },
    Unreachable(String),
    TimedOut(Duration),
}

impl<P: ReplyPayload> Exchange<P> {
    /// Classify a remote reply expecting payload `P`
    pub fn classify(reply: RemoteReply) -> Self {
        match reply {
            Ok(Answer::Success(reply)) => match P::from_reply(reply) {
                Some(payload) => Exchange::Success(payload),
                None => Exchange::Mismatched { expected: P::NAME },
            },
            Ok(Answer::Failure(detail)) => Exchange::Rejected(detail),
            Err(TransportError::Unreachable { reason, .. }) => Exchange::Unreachable(reason),
            Err(TransportError::TimedOut { after, .. }) => Exchange::TimedOut(after),
        }
    }
}

/// Convert a remote reply into the expected payload
///
/// `context` synthesizes the user-visible message used when no answer
/// arrived at all.
pub fn expect_payload<P: ReplyPayload>(
    command: CommandKind,
    reply: RemoteReply,
    context: impl FnOnce() -> String,
) -> crate::error::Result<P> {
    use crate::error::Error;

    match Exchange::<P>::classify(reply) {
        Exchange::Success(payload) => Ok(payload),
        Exchange::Rejected(detail) => Err(Error::RemoteOperation {
            command: command.to_string(),
            detail,
        }),
        Exchange::Mismatched { expected } => Err(Error::UnexpectedReply {
            command: command.to_string(),
            expected: expected.to_string(),
        }),
        Exchange::Unreachable(reason) => Err(Error::RemoteCommunication {
            message: format!("{} ({})", context(), reason),
        }),
        Exchange::TimedOut(after) => Err(Error::OperationTimedOut {
            message: context(),
            after,
        }),
    }
}
