//! Checkpoint persistence.
//!
//! A checkpoint maps a replication id to the last source sequence whose
//! batch was fully applied at the target. Checkpoints only move forward.

use crate::error::{ReplicationError, ReplicationResult};
use crate::http::CouchClient;
use crate::replication_id::ReplicationId;
use docsync_protocol::{LocalDocument, Sequence};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Stores replication checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Returns the stored checkpoint, if any.
    fn get(&self, id: &ReplicationId) -> ReplicationResult<Option<Sequence>>;

    /// Stores a checkpoint.
    ///
    /// Must be atomic with respect to concurrent reads of the same id and
    /// must never move an existing checkpoint backwards.
    fn put(&self, id: &ReplicationId, sequence: Sequence) -> ReplicationResult<()>;
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<ReplicationId, Sequence>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no checkpoints are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, id: &ReplicationId) -> ReplicationResult<Option<Sequence>> {
        Ok(self.entries.read().get(id).copied())
    }

    fn put(&self, id: &ReplicationId, sequence: Sequence) -> ReplicationResult<()> {
        let mut entries = self.entries.write();
        let entry = entries.entry(id.clone()).or_insert(sequence);
        *entry = (*entry).max(sequence);
        Ok(())
    }
}

/// Checkpoints kept as `_local` documents on a remote database.
///
/// Used for push replications, where the target is the remote side.
pub struct RemoteCheckpointStore {
    client: Arc<CouchClient>,
}

impl RemoteCheckpointStore {
    /// Creates a store writing through the given client.
    pub fn new(client: Arc<CouchClient>) -> Self {
        Self { client }
    }
}

impl CheckpointStore for RemoteCheckpointStore {
    fn get(&self, id: &ReplicationId) -> ReplicationResult<Option<Sequence>> {
        Ok(self
            .client
            .get_local(&id.checkpoint_doc_id())?
            .map(|doc| doc.last_sequence))
    }

    fn put(&self, id: &ReplicationId, sequence: Sequence) -> ReplicationResult<()> {
        let doc_id = id.checkpoint_doc_id();
        let persist = |err: ReplicationError| ReplicationError::CheckpointPersist(err.to_string());

        let current = self.client.get_local(&doc_id).map_err(persist)?;
        let last_sequence = current
            .map(|doc| doc.last_sequence.max(sequence))
            .unwrap_or(sequence);

        self.client
            .put_local(&LocalDocument {
                id: doc_id,
                last_sequence,
            })
            .map_err(persist)
    }
}
