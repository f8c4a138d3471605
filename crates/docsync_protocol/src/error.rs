//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A revision id string could not be parsed.
    #[error("invalid revision id {value:?}: {reason}")]
    InvalidRevisionId {
        /// The offending input.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A revision breaks the generation/parent invariant.
    #[error("invalid revision {revision}: {reason}")]
    InvalidRevision {
        /// Textual revision id.
        revision: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A history path could not be merged into a revision tree.
    #[error("invalid revision path for document {doc_id}: {reason}")]
    InvalidPath {
        /// Document the path belongs to.
        doc_id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// JSON encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::InvalidRevisionId {
            value: "x".into(),
            reason: "missing generation",
        };
        assert!(err.to_string().contains("missing generation"));

        let err: ProtocolError = serde_json::from_str::<u64>("{").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Codec(_)));
    }
}
