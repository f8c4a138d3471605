//! Protocol messages for replication.
//!
//! The shapes follow the CouchDB replication endpoints: `_changes`,
//! `_revs_diff`, `_bulk_get`, `_bulk_docs` and `_local` documents. All
//! messages are JSON on the wire.

use crate::filter::PullFilter;
use crate::revision::{DocumentRevs, RevisionId};
use crate::sequence::Sequence;
use crate::ProtocolResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// JSON encoding shared by every message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Encodes to JSON bytes.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Request for one page of a changes feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesRequest {
    /// Return changes strictly after this sequence.
    pub since: Sequence,
    /// Maximum number of rows.
    pub limit: u32,
    /// Optional named filter.
    pub filter: Option<PullFilter>,
}

impl ChangesRequest {
    /// Creates a new changes request.
    pub fn new(since: Sequence, limit: u32, filter: Option<PullFilter>) -> Self {
        Self {
            since,
            limit,
            filter,
        }
    }

    /// Query-string pairs for `GET _changes`.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("style".to_string(), "all_docs".to_string()),
            ("since".to_string(), self.since.to_string()),
            ("limit".to_string(), self.limit.to_string()),
        ];
        if let Some(filter) = &self.filter {
            pairs.extend(filter.query_pairs());
        }
        pairs
    }

    /// Parses query-string pairs back into a request.
    ///
    /// Unknown keys become filter parameters when a filter is named.
    pub fn from_query_pairs<I>(pairs: I, default_limit: u32) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut since = Sequence::START;
        let mut limit = default_limit;
        let mut name = None;
        let mut parameters = BTreeMap::new();

        for (key, value) in pairs {
            match key.as_str() {
                "since" => since = value.parse::<u64>().map(Sequence::new).unwrap_or(since),
                "limit" => limit = value.parse().unwrap_or(limit),
                "style" => {}
                "filter" => name = Some(value),
                _ => {
                    parameters.insert(key, value);
                }
            }
        }

        Self {
            since,
            limit,
            filter: name.map(|name| PullFilter { name, parameters }),
        }
    }
}

/// One changed document in a changes page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// Sequence at which the document last changed.
    pub seq: Sequence,
    /// Document id.
    pub id: String,
    /// Current leaf revisions of the document.
    pub changes: Vec<RevisionId>,
    /// True if the winning revision is a deletion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// One page of a changes feed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Changed documents in sequence order.
    pub results: Vec<ChangeRow>,
    /// Sequence to resume from.
    pub last_seq: Sequence,
}

impl ChangesResponse {
    /// Creates a page.
    pub fn new(results: Vec<ChangeRow>, last_seq: Sequence) -> Self {
        Self { results, last_seq }
    }

    /// Returns true if the page has no rows.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Groups the page's leaf revisions by document.
    pub fn revisions_by_document(&self) -> BTreeMap<String, Vec<RevisionId>> {
        let mut grouped: BTreeMap<String, Vec<RevisionId>> = BTreeMap::new();
        for row in &self.results {
            let revs = grouped.entry(row.id.clone()).or_default();
            for rev in &row.changes {
                if !revs.contains(rev) {
                    revs.push(rev.clone());
                }
            }
        }
        grouped
    }
}

/// `POST _revs_diff` body: candidate revisions per document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffRequest(pub BTreeMap<String, Vec<RevisionId>>);

/// Missing revisions for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingRevisions {
    /// Revisions the responder does not have.
    pub missing: Vec<RevisionId>,
}

/// `POST _revs_diff` response. Documents with nothing missing are omitted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffResponse(pub BTreeMap<String, MissingRevisions>);

impl RevsDiffResponse {
    /// Builds a response from a plain map, dropping empty entries.
    pub fn from_missing(missing: BTreeMap<String, Vec<RevisionId>>) -> Self {
        Self(
            missing
                .into_iter()
                .filter(|(_, revs)| !revs.is_empty())
                .map(|(id, missing)| (id, MissingRevisions { missing }))
                .collect(),
        )
    }

    /// Flattens the response into a plain map.
    pub fn into_missing(self) -> BTreeMap<String, Vec<RevisionId>> {
        self.0
            .into_iter()
            .filter(|(_, m)| !m.missing.is_empty())
            .map(|(id, m)| (id, m.missing))
            .collect()
    }
}

/// One revision to fetch together with its ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BulkGetItem {
    /// Document id.
    pub id: String,
    /// Revision to fetch.
    pub rev: RevisionId,
}

impl BulkGetItem {
    /// Creates a new item.
    pub fn new(id: impl Into<String>, rev: RevisionId) -> Self {
        Self { id: id.into(), rev }
    }
}

/// `POST _bulk_get` body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BulkGetRequest {
    /// Revisions to fetch.
    pub docs: Vec<BulkGetItem>,
}

/// `POST _bulk_get` response: one root-to-revision path per item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BulkGetResponse {
    /// Fetched paths, in request order.
    pub results: Vec<DocumentRevs>,
}

/// `POST _bulk_docs` body.
///
/// `new_edits` is always false for replication: the receiver merges the
/// given revisions into its trees instead of creating new ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Paths to merge.
    pub docs: Vec<DocumentRevs>,
    /// Whether the receiver should mint new revisions.
    #[serde(default)]
    pub new_edits: bool,
}

impl BulkDocsRequest {
    /// Creates a replication write.
    pub fn replicated(docs: Vec<DocumentRevs>) -> Self {
        Self {
            docs,
            new_edits: false,
        }
    }
}

/// `POST _bulk_docs` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsResponse {
    /// True when every path was merged.
    pub ok: bool,
    /// Number of documents whose tree grew.
    pub inserted: usize,
}

/// `_local` document holding a replication checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDocument {
    /// Local document id, without the `_local/` prefix.
    #[serde(rename = "_id")]
    pub id: String,
    /// Last source sequence fully applied at the target.
    pub last_sequence: Sequence,
}

/// `GET <db>` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name.
    pub db_name: String,
    /// Number of non-deleted documents.
    pub doc_count: usize,
    /// Latest sequence.
    pub update_seq: Sequence,
}

impl WireMessage for ChangesResponse {}
impl WireMessage for RevsDiffRequest {}
impl WireMessage for RevsDiffResponse {}
impl WireMessage for BulkGetRequest {}
impl WireMessage for BulkGetResponse {}
impl WireMessage for BulkDocsRequest {}
impl WireMessage for BulkDocsResponse {}
impl WireMessage for LocalDocument {}
impl WireMessage for DatabaseInfo {}
