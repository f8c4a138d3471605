//! Per-document revision trees.

use crate::error::ProtocolResult;
use crate::revision::{validate_path, Revision, RevisionId};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
struct Node {
    revision: Revision,
    children: BTreeSet<RevisionId>,
}

/// Every revision ever seen for one document.
///
/// The tree only grows: merging a history path attaches the unseen part of
/// the path and never removes or reorders existing branches. Leaves are the
/// current revisions; more than one live leaf is a conflict, which the tree
/// keeps as-is.
///
/// # Invariants
///
/// - A node's children all name it as their parent
/// - A node whose parent is unknown is a root (possibly a stemmed one)
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionTree {
    doc_id: String,
    nodes: BTreeMap<RevisionId, Node>,
}

impl RevisionTree {
    /// Creates an empty tree.
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: BTreeMap::new(),
        }
    }

    /// Returns the document id.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Returns the number of revisions in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the tree holds no revisions.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if the revision is in the tree.
    pub fn contains(&self, id: &RevisionId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Looks up a revision.
    pub fn get(&self, id: &RevisionId) -> Option<&Revision> {
        self.nodes.get(id).map(|n| &n.revision)
    }

    /// Iterates over all revisions in id order.
    pub fn revisions(&self) -> impl Iterator<Item = &Revision> {
        self.nodes.values().map(|n| &n.revision)
    }

    /// Returns true if the revision is in the tree and has no children.
    pub fn is_leaf(&self, id: &RevisionId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.children.is_empty())
    }

    /// Merges a root-to-leaf history path.
    ///
    /// Returns the number of revisions that were new to the tree.
    pub fn insert_path(&mut self, path: &[Revision]) -> ProtocolResult<usize> {
        validate_path(&self.doc_id, path)?;

        let mut added = 0;
        for revision in path {
            if self.nodes.contains_key(&revision.id) {
                continue;
            }

            if let Some(parent) = revision.parent.as_ref() {
                if let Some(node) = self.nodes.get_mut(parent) {
                    node.children.insert(revision.id.clone());
                }
            }

            // Stemmed roots received earlier may hang off this revision.
            let children = self
                .nodes
                .iter()
                .filter(|(_, n)| n.revision.parent.as_ref() == Some(&revision.id))
                .map(|(id, _)| id.clone())
                .collect();

            self.nodes.insert(
                revision.id.clone(),
                Node {
                    revision: revision.clone(),
                    children,
                },
            );
            added += 1;
        }

        Ok(added)
    }

    /// Returns all leaves, live or deleted, in id order.
    pub fn leaves(&self) -> Vec<&Revision> {
        self.nodes
            .values()
            .filter(|n| n.children.is_empty())
            .map(|n| &n.revision)
            .collect()
    }

    /// Returns the ids of all leaves.
    pub fn leaf_ids(&self) -> Vec<RevisionId> {
        self.leaves().into_iter().map(|r| r.id.clone()).collect()
    }

    /// Returns the leaves that are not deletion markers.
    pub fn live_leaves(&self) -> Vec<&Revision> {
        self.leaves().into_iter().filter(|r| !r.deleted).collect()
    }

    /// Returns true if more than one live leaf exists.
    pub fn is_conflicted(&self) -> bool {
        self.live_leaves().len() > 1
    }

    /// Picks the current revision deterministically.
    ///
    /// Live leaves beat deleted ones, then the higher generation wins, then
    /// the higher digest. Every replica picks the same winner for the same
    /// tree.
    pub fn winner(&self) -> Option<&Revision> {
        self.leaves()
            .into_iter()
            .max_by(|a, b| (!a.deleted, &a.id).cmp(&(!b.deleted, &b.id)))
    }

    /// Returns the known history of a revision, oldest first.
    pub fn path_to(&self, id: &RevisionId) -> Option<Vec<Revision>> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(id);
        while let Some(node) = cursor {
            path.push(node.revision.clone());
            cursor = node
                .revision
                .parent
                .as_ref()
                .and_then(|parent| self.nodes.get(parent));
        }
        if path.is_empty() {
            return None;
        }
        path.reverse();
        Some(path)
    }

    /// Returns the candidates that are not in the tree, without duplicates.
    pub fn missing(&self, candidates: &[RevisionId]) -> Vec<RevisionId> {
        let mut seen = BTreeSet::new();
        candidates
            .iter()
            .filter(|id| !self.contains(id) && seen.insert((*id).clone()))
            .cloned()
            .collect()
    }
}
