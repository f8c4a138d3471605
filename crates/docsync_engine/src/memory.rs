//! Embedded in-memory document store.

use crate::checkpoint::CheckpointStore;
use crate::error::{ReplicationError, ReplicationResult};
use crate::replication_id::ReplicationId;
use crate::store::DocumentStore;
use docsync_protocol::{
    Attachment, BulkGetItem, ChangeRow, ChangesResponse, DocumentRevs, LocalDocument, PullFilter,
    Revision, RevisionId, RevisionTree, Sequence,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A changes-feed filter: receives the winning revision and the filter
/// parameters, returns true to include the document.
pub type FilterFn = dyn Fn(&Revision, &BTreeMap<String, String>) -> bool + Send + Sync;

struct StoredDocument {
    tree: RevisionTree,
    sequence: Sequence,
}

#[derive(Default)]
struct Documents {
    by_id: BTreeMap<String, StoredDocument>,
    last_sequence: Sequence,
}

impl Documents {
    /// Merges a path and bumps the document's sequence if the tree grew.
    fn merge(&mut self, id: &str, path: &[Revision]) -> ReplicationResult<usize> {
        let next = self.last_sequence.next();
        let doc = self
            .by_id
            .entry(id.to_string())
            .or_insert_with(|| StoredDocument {
                tree: RevisionTree::new(id),
                sequence: next,
            });
        let added = doc.tree.insert_path(path)?;
        if added > 0 {
            doc.sequence = next;
            self.last_sequence = next;
        }
        Ok(added)
    }
}

/// An MVCC document store kept in memory.
///
/// Each document keeps its full revision tree. Every write, local or
/// replicated, gives the document a new sequence in the changes feed.
/// Checkpoints are stored alongside as local documents, so the store can
/// serve as both a replication endpoint and a checkpoint store.
pub struct MemoryDatastore {
    id: Uuid,
    documents: RwLock<Documents>,
    local_documents: RwLock<HashMap<String, LocalDocument>>,
    filters: RwLock<HashMap<String, Arc<FilterFn>>>,
}

impl MemoryDatastore {
    /// Creates an empty store with a random identifier.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Creates an empty store with a fixed identifier.
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            documents: RwLock::new(Documents::default()),
            local_documents: RwLock::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the store's unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creates a document.
    ///
    /// Fails if the document exists and is not deleted. A deleted document
    /// is recreated on top of its winning tombstone.
    pub fn create_document(&self, id: &str, body: Value) -> ReplicationResult<Revision> {
        self.create_document_with_attachments(id, body, BTreeMap::new())
    }

    /// Creates a document carrying attachments.
    pub fn create_document_with_attachments(
        &self,
        id: &str,
        body: Value,
        attachments: BTreeMap<String, Attachment>,
    ) -> ReplicationResult<Revision> {
        let mut documents = self.documents.write();
        let parent = match documents.by_id.get(id).and_then(|d| d.tree.winner()) {
            Some(winner) if !winner.deleted => {
                return Err(ReplicationError::Store(format!(
                    "document {} already exists",
                    id
                )))
            }
            Some(tombstone) => Some(tombstone.id.clone()),
            None => None,
        };

        let revision = Revision::new(parent.as_ref(), body, false, attachments);
        documents.merge(id, std::slice::from_ref(&revision))?;
        Ok(revision)
    }

    /// Writes a new revision on top of a current leaf.
    ///
    /// Any live leaf may be extended, so conflicting branches can be
    /// edited independently.
    pub fn update_document(
        &self,
        id: &str,
        parent: &RevisionId,
        body: Value,
    ) -> ReplicationResult<Revision> {
        self.write_child(id, parent, body, false)
    }

    /// Writes a deletion marker on top of a current leaf.
    pub fn delete_document(&self, id: &str, parent: &RevisionId) -> ReplicationResult<Revision> {
        self.write_child(id, parent, Value::Null, true)
    }

    fn write_child(
        &self,
        id: &str,
        parent: &RevisionId,
        body: Value,
        deleted: bool,
    ) -> ReplicationResult<Revision> {
        let mut documents = self.documents.write();
        let is_live_leaf = documents.by_id.get(id).is_some_and(|d| {
            d.tree.is_leaf(parent) && d.tree.get(parent).is_some_and(|r| !r.deleted)
        });
        if !is_live_leaf {
            return Err(ReplicationError::Store(format!(
                "revision {} is not a current revision of {}",
                parent, id
            )));
        }

        let revision = Revision::new(Some(parent), body, deleted, BTreeMap::new());
        documents.merge(id, std::slice::from_ref(&revision))?;
        Ok(revision)
    }

    /// Returns the winning revision unless the document is deleted or
    /// unknown.
    pub fn get_document(&self, id: &str) -> Option<Revision> {
        self.documents
            .read()
            .by_id
            .get(id)
            .and_then(|d| d.tree.winner())
            .filter(|r| !r.deleted)
            .cloned()
    }

    /// Returns a copy of a document's revision tree.
    pub fn revision_tree(&self, id: &str) -> Option<RevisionTree> {
        self.documents.read().by_id.get(id).map(|d| d.tree.clone())
    }

    /// Returns the ids of documents with more than one live leaf.
    pub fn conflicted_documents(&self) -> Vec<String> {
        self.documents
            .read()
            .by_id
            .iter()
            .filter(|(_, d)| d.tree.is_conflicted())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the latest sequence.
    pub fn last_sequence(&self) -> Sequence {
        self.documents.read().last_sequence
    }

    /// Registers a named changes-feed filter.
    pub fn register_filter<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Revision, &BTreeMap<String, String>) -> bool + Send + Sync + 'static,
    {
        self.filters.write().insert(name.into(), Arc::new(filter));
    }

    /// Reads a local (non-replicated) document.
    pub fn get_local(&self, id: &str) -> Option<LocalDocument> {
        self.local_documents.read().get(id).cloned()
    }

    /// Writes a local (non-replicated) document.
    pub fn put_local(&self, document: LocalDocument) {
        self.local_documents
            .write()
            .insert(document.id.clone(), document);
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryDatastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let documents = self.documents.read();
        f.debug_struct("MemoryDatastore")
            .field("id", &self.id)
            .field("documents", &documents.by_id.len())
            .field("last_sequence", &documents.last_sequence)
            .finish()
    }
}

impl DocumentStore for MemoryDatastore {
    fn identifier(&self) -> String {
        format!("local:{}", self.id)
    }

    fn changes(
        &self,
        since: Sequence,
        limit: u32,
        filter: Option<&PullFilter>,
    ) -> ReplicationResult<ChangesResponse> {
        let predicate = match filter {
            Some(filter) => {
                let registered = self.filters.read().get(&filter.name).cloned();
                match registered {
                    Some(predicate) => Some((predicate, &filter.parameters)),
                    None => {
                        return Err(ReplicationError::Store(format!(
                            "unknown filter {}",
                            filter.name
                        )))
                    }
                }
            }
            None => None,
        };

        let documents = self.documents.read();
        let mut changed: Vec<(&String, &StoredDocument)> = documents
            .by_id
            .iter()
            .filter(|(_, d)| d.sequence > since)
            .collect();
        changed.sort_by_key(|(_, d)| d.sequence);

        let mut results = Vec::new();
        let mut last_seq = since;
        for (id, doc) in changed {
            if results.len() >= limit as usize {
                break;
            }
            last_seq = doc.sequence;

            let Some(winner) = doc.tree.winner() else {
                continue;
            };
            if let Some((predicate, parameters)) = &predicate {
                if !predicate(winner, *parameters) {
                    continue;
                }
            }
            results.push(ChangeRow {
                seq: doc.sequence,
                id: id.clone(),
                changes: doc.tree.leaf_ids(),
                deleted: winner.deleted,
            });
        }

        Ok(ChangesResponse::new(results, last_seq))
    }

    fn revs_diff(
        &self,
        candidates: &BTreeMap<String, Vec<RevisionId>>,
    ) -> ReplicationResult<BTreeMap<String, Vec<RevisionId>>> {
        let documents = self.documents.read();
        Ok(candidates
            .iter()
            .map(|(id, revs)| {
                let missing = match documents.by_id.get(id) {
                    Some(doc) => doc.tree.missing(revs),
                    None => RevisionTree::new(id.as_str()).missing(revs),
                };
                (id.clone(), missing)
            })
            .filter(|(_, missing)| !missing.is_empty())
            .collect())
    }

    fn bulk_get(&self, items: &[BulkGetItem]) -> ReplicationResult<Vec<DocumentRevs>> {
        let documents = self.documents.read();
        items
            .iter()
            .map(|item| {
                documents
                    .by_id
                    .get(&item.id)
                    .and_then(|d| d.tree.path_to(&item.rev))
                    .map(|path| DocumentRevs::new(item.id.clone(), path))
                    .ok_or_else(|| {
                        ReplicationError::Store(format!(
                            "revision {} of {} not found",
                            item.rev, item.id
                        ))
                    })
            })
            .collect()
    }

    fn bulk_insert(&self, paths: &[DocumentRevs]) -> ReplicationResult<usize> {
        // Validate everything up front so the merge below cannot fail half way.
        for path in paths {
            path.validate()?;
        }

        let mut documents = self.documents.write();
        let mut grown = BTreeMap::new();
        for path in paths {
            let added = documents.merge(&path.id, &path.revisions)?;
            *grown.entry(path.id.as_str()).or_insert(0) += added;
        }
        let inserted = grown.values().filter(|added| **added > 0).count();
        debug!(
            store = %self.id,
            paths = paths.len(),
            inserted,
            "merged replicated revisions"
        );
        Ok(inserted)
    }

    fn document_count(&self) -> ReplicationResult<usize> {
        Ok(self
            .documents
            .read()
            .by_id
            .values()
            .filter(|d| d.tree.winner().is_some_and(|w| !w.deleted))
            .count())
    }
}

impl CheckpointStore for MemoryDatastore {
    fn get(&self, id: &ReplicationId) -> ReplicationResult<Option<Sequence>> {
        Ok(self
            .get_local(&id.checkpoint_doc_id())
            .map(|doc| doc.last_sequence))
    }

    fn put(&self, id: &ReplicationId, sequence: Sequence) -> ReplicationResult<()> {
        let doc_id = id.checkpoint_doc_id();
        let mut local = self.local_documents.write();
        let doc = local.entry(doc_id.clone()).or_insert(LocalDocument {
            id: doc_id,
            last_sequence: sequence,
        });
        doc.last_sequence = doc.last_sequence.max(sequence);
        Ok(())
    }
}
