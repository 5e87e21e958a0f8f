//! Error types for the storage motion orchestrator
//!
//! One error type covers every fatal condition of the migration protocol,
//! the async dispatcher and the storage drivers. The caller of a migration
//! sees a single `Error` regardless of which phase failed.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Migration Protocol Errors
    // =========================================================================
    #[error("Precondition violated for volume {volume}: {reason}")]
    PreconditionViolation { volume: String, reason: String },

    #[error("{message}")]
    RemoteCommunication { message: String },

    #[error("{detail}")]
    RemoteOperation { command: String, detail: String },

    #[error("Resource unavailable: {message} (timed out after {after:?})")]
    OperationTimedOut { message: String, after: Duration },

    #[error("Compensation failed for volume {volume}: {reason}")]
    Compensation { volume: String, reason: String },

    #[error("Unexpected reply to {command}: expected {expected}")]
    UnexpectedReply { command: String, expected: String },

    #[error("Invalid migration state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // =========================================================================
    // Dispatch / Driver Errors
    // =========================================================================
    #[error("No remote endpoint available to send command for pool {pool}")]
    NoEndpoint { pool: String },

    #[error("No storage driver registered for pool {pool}")]
    DriverUnavailable { pool: String },

    #[error("Completion callback for {operation} was dropped before it fired")]
    CallbackAbandoned { operation: String },

    #[error("Managed storage backend error: {backend} - {reason}")]
    ManagedBackend { backend: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Transport / Parse Errors
    // =========================================================================
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action an outer caller may take on error.
///
/// The orchestrator never retries a protocol phase itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, operator attention required
    NoRetry,
}

impl Error {
    /// Determine what action an outer caller should take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Agent unreachable - retry with backoff
            Error::RemoteCommunication { .. } | Error::NoEndpoint { .. } | Error::Http(_) => {
                ErrorAction::RetryWithBackoff
            }

            // Resource unavailable - longer retry
            Error::OperationTimedOut { .. } => ErrorAction::RetryAfter(Duration::from_secs(300)),

            // Snapshot state may change - medium retry
            Error::PreconditionViolation { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(60))
            }

            // Explicit rejection and configuration problems need attention
            Error::RemoteOperation { .. }
            | Error::Configuration(_)
            | Error::UnexpectedReply { .. }
            | Error::InvalidTransition { .. }
            | Error::DriverUnavailable { .. }
            | Error::YamlParse(_)
            | Error::JsonParse(_) => ErrorAction::NoRetry,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable by a caller
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RemoteCommunication { .. }
                | Error::OperationTimedOut { .. }
                | Error::NoEndpoint { .. }
                | Error::Http(_)
        )
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
