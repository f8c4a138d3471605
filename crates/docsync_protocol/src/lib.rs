//! # docsync protocol
//!
//! Revision model and wire messages for docsync replication.
//!
//! This crate provides:
//! - `RevisionId`, `Revision` and `DocumentRevs` for MVCC documents
//! - `RevisionTree` for per-document branch history
//! - `Sequence` tokens and `PullFilter` for changes feeds
//! - Protocol messages (changes, revs-diff, bulk-get, bulk-docs)
//! - JSON encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod filter;
pub mod messages;
mod revision;
mod sequence;
mod tree;

pub use error::{ProtocolError, ProtocolResult};
pub use filter::PullFilter;
pub use messages::{
    BulkDocsRequest, BulkDocsResponse, BulkGetItem, BulkGetRequest, BulkGetResponse, ChangeRow,
    ChangesRequest, ChangesResponse, DatabaseInfo, LocalDocument, MissingRevisions,
    RevsDiffRequest, RevsDiffResponse, WireMessage,
};
pub use revision::{Attachment, DocumentRevs, Revision, RevisionId};
pub use sequence::Sequence;
pub use tree::RevisionTree;
