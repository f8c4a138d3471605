//! Deterministic replication identifiers.

use crate::config::Direction;
use crate::error::ReplicationResult;
use docsync_protocol::{PullFilter, ProtocolError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifies an equivalently-configured replication.
///
/// Used as the checkpoint key. The same direction, endpoints and filter
/// always produce the same id, across runs and processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationId(String);

impl ReplicationId {
    /// Derives the id from the replication's defining inputs.
    ///
    /// `source` and `target` are store identifiers: the credential-free URL
    /// for a remote and the store id for a local database.
    pub fn compute(
        direction: Direction,
        source: &str,
        target: &str,
        filter: Option<&PullFilter>,
    ) -> ReplicationResult<Self> {
        let canonical = serde_json::to_vec(&(direction.as_str(), source, target, filter))
            .map_err(ProtocolError::from)?;
        let digest = Sha256::digest(&canonical);
        Ok(Self(hex::encode(digest)))
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the `_local` document holding this replication's checkpoint.
    pub fn checkpoint_doc_id(&self) -> String {
        format!("docsync-checkpoint-{}", self.0)
    }
}

impl fmt::Display for ReplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
