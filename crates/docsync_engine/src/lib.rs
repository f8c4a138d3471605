//! # docsync engine
//!
//! Replication engine for MVCC document stores speaking a CouchDB-style
//! replication protocol.
//!
//! This crate provides:
//! - The `DocumentStore` contract and an in-memory `MemoryDatastore`
//! - An HTTP client abstraction and the remote `CouchClient`
//! - Request/response interceptors, including cookie session auth
//! - Checkpoint stores and deterministic replication ids
//! - Pull and push strategies, the `Replicator` state machine and its
//!   event bus
//! - A loopback remote for in-process testing
//!
//! ## Architecture
//!
//! A replication copies every revision the target lacks from the source,
//! batch by batch:
//! 1. Read one page of the source's changes feed from the checkpoint
//! 2. Ask the target which of the changed revisions it is missing
//! 3. Fetch the missing revisions with their ancestry
//! 4. Merge them into the target's revision trees
//! 5. Persist the page's last sequence as the new checkpoint
//!
//! ## Key Invariants
//!
//! - Checkpoints never move backwards
//! - A checkpoint is written only after its batch is merged
//! - Merges never drop branches; conflicts stay in the tree
//! - A cancelled run finishes the batch it is working on
//! - Credentials embedded in a remote URI are never sent with requests

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod checkpoint;
mod config;
mod cookie;
mod error;
mod event;
mod http;
mod interceptor;
mod loopback;
mod memory;
mod replication_id;
mod replicator;
mod store;
mod strategy;

pub use builder::{Endpoint, ReplicatorBuilder};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, RemoteCheckpointStore};
pub use config::{Direction, RetryConfig, StrategySettings};
pub use cookie::{CookieInterceptor, SESSION_COOKIE};
pub use error::{ReplicationError, ReplicationResult};
pub use event::{EventBus, ListenerId, ReplicationEvent, ReplicationListener};
pub use http::{CouchClient, HttpClient, HttpMethod, HttpRequest, HttpResponse, MAX_REPLAYS};
pub use interceptor::{InterceptorChain, RequestInterceptor, ResponseInterceptor};
pub use loopback::{LoopbackRemote, Route};
pub use memory::{FilterFn, MemoryDatastore};
pub use replication_id::ReplicationId;
pub use replicator::{Replicator, ReplicatorState};
pub use store::DocumentStore;
pub use strategy::{
    PullStrategy, PushStrategy, ReplicationConfig, ReplicationStrategy, RunOutcome, Strategy,
};
