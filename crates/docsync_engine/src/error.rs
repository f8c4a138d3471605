//! Error types for the replication engine.

use docsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while building or running a replication.
///
/// Revision conflicts are not errors: divergent edits end up as extra
/// leaves in the revision tree.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid builder input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The checkpoint could not be written.
    #[error("failed to persist checkpoint: {0}")]
    CheckpointPersist(String),

    /// Operation not allowed in the current replicator state.
    #[error("cannot {operation} while replicator is {from}")]
    IllegalState {
        /// Current state.
        from: String,
        /// Attempted operation.
        operation: &'static str,
    },

    /// Malformed protocol data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The document store rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// The replication worker panicked.
    #[error("replication worker panicked: {0}")]
    Panicked(String),

    /// The worker thread could not be spawned.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplicationError::Network { retryable: true, .. })
    }
}
