//! The document store contract used by both ends of a replication.

use crate::error::ReplicationResult;
use docsync_protocol::{BulkGetItem, ChangesResponse, DocumentRevs, PullFilter, RevisionId, Sequence};
use std::collections::BTreeMap;

/// One side of a replication.
///
/// The engine needs only this much from a store: read its changes feed,
/// report which revisions it lacks, hand out revisions with their ancestry,
/// and merge revision paths into its trees. It is implemented by the
/// embedded [`MemoryDatastore`](crate::MemoryDatastore) and by the remote
/// [`CouchClient`](crate::CouchClient), so one strategy loop serves both
/// directions.
pub trait DocumentStore: Send + Sync {
    /// Stable identifier used when deriving replication ids.
    fn identifier(&self) -> String;

    /// Returns changes strictly after `since`, at most `limit` rows.
    fn changes(
        &self,
        since: Sequence,
        limit: u32,
        filter: Option<&PullFilter>,
    ) -> ReplicationResult<ChangesResponse>;

    /// Returns, per document, the candidate revisions this store lacks.
    ///
    /// Documents with nothing missing are omitted.
    fn revs_diff(
        &self,
        candidates: &BTreeMap<String, Vec<RevisionId>>,
    ) -> ReplicationResult<BTreeMap<String, Vec<RevisionId>>>;

    /// Returns each requested revision together with its known ancestry.
    fn bulk_get(&self, items: &[BulkGetItem]) -> ReplicationResult<Vec<DocumentRevs>>;

    /// Merges revision paths into the store's trees.
    ///
    /// Existing branches are never removed; a divergent path becomes an
    /// additional leaf. The write is durable when this returns. Returns the
    /// number of documents whose tree grew.
    fn bulk_insert(&self, documents: &[DocumentRevs]) -> ReplicationResult<usize>;

    /// Number of documents whose winning revision is not deleted.
    fn document_count(&self) -> ReplicationResult<usize>;
}
