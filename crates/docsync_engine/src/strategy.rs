//! Replication strategies.
//!
//! A strategy drives one replication attempt end to end: it pages through
//! the source's changes feed from the last checkpoint, asks the target
//! which revisions it lacks, fetches those with their ancestry, merges them
//! into the target and commits a checkpoint after every batch.
//!
//! Pull and push run the same loop with the roles of the local and remote
//! stores swapped. [`Strategy`] dispatches between the two.

use crate::checkpoint::CheckpointStore;
use crate::config::{Direction, StrategySettings};
use crate::cookie::CookieInterceptor;
use crate::error::{ReplicationError, ReplicationResult};
use crate::event::{EventBus, ReplicationEvent};
use crate::replication_id::ReplicationId;
use crate::store::DocumentStore;
use docsync_protocol::{
    BulkGetItem, ChangesResponse, DocumentRevs, PullFilter, RevisionId, Sequence,
};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};
use url::Url;

/// How a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The feed was exhausted or the batch limit was reached.
    Completed,
    /// Cancellation was requested and honored at a batch boundary.
    Cancelled,
}

/// Immutable configuration shared by every run of a replicator.
pub struct ReplicationConfig {
    pub(crate) direction: Direction,
    pub(crate) source: Arc<dyn DocumentStore>,
    pub(crate) target: Arc<dyn DocumentStore>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) filter: Option<PullFilter>,
    pub(crate) settings: StrategySettings,
    pub(crate) replication_id: ReplicationId,
    pub(crate) remote: Url,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) session: Option<Arc<CookieInterceptor>>,
}

impl ReplicationConfig {
    /// Returns the direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the pull filter, if any.
    pub fn filter(&self) -> Option<&PullFilter> {
        self.filter.as_ref()
    }

    /// Returns the strategy settings.
    pub fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    /// Returns the replication id.
    pub fn replication_id(&self) -> &ReplicationId {
        &self.replication_id
    }

    /// Returns the credential-free remote URL.
    pub fn remote(&self) -> &Url {
        &self.remote
    }

    /// Returns the session interceptor built from URL credentials.
    pub fn session(&self) -> Option<&Arc<CookieInterceptor>> {
        self.session.as_ref()
    }
}

impl fmt::Debug for ReplicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationConfig")
            .field("direction", &self.direction)
            .field("source", &self.source.identifier())
            .field("target", &self.target.identifier())
            .field("filter", &self.filter)
            .field("settings", &self.settings)
            .field("replication_id", &self.replication_id)
            .finish()
    }
}

/// Mutable state of one run.
#[derive(Debug, Default)]
struct RunState {
    cancel: AtomicBool,
    terminated: AtomicBool,
    documents: AtomicUsize,
    batches: AtomicUsize,
}

/// Behavior shared by pull and push strategies.
pub trait ReplicationStrategy: Send + Sync {
    /// Runs one replication attempt on the calling thread.
    fn run(&self) -> ReplicationResult<RunOutcome>;

    /// Asks the run to stop at the next batch boundary.
    fn request_cancel(&self);

    /// Returns true once cancellation was requested.
    fn is_cancel_requested(&self) -> bool;

    /// Returns true once the current run has ended.
    fn is_terminated(&self) -> bool;

    /// Returns the replicator's event bus.
    fn event_bus(&self) -> &Arc<EventBus>;

    /// Returns the replication id.
    fn replication_id(&self) -> &ReplicationId;

    /// Documents replicated by the current run.
    fn document_counter(&self) -> usize;

    /// Batches committed by the current run.
    fn batch_counter(&self) -> usize;

    /// Credential-free URL of the remote side.
    fn remote_descriptor(&self) -> &Url;
}

/// The replication loop, independent of direction.
struct ReplicationRun {
    config: Arc<ReplicationConfig>,
    state: RwLock<Arc<RunState>>,
}

impl ReplicationRun {
    fn new(config: Arc<ReplicationConfig>) -> Self {
        Self {
            config,
            state: RwLock::new(Arc::new(RunState::default())),
        }
    }

    fn current(&self) -> Arc<RunState> {
        Arc::clone(&*self.state.read())
    }

    /// Returns the state for a new run, replacing it if the previous run
    /// already ended. A cancel requested before the first run is kept.
    fn begin(&self) -> Arc<RunState> {
        let mut state = self.state.write();
        if state.terminated.load(Ordering::SeqCst) {
            *state = Arc::new(RunState::default());
        }
        Arc::clone(&*state)
    }

    fn execute(&self) -> ReplicationResult<RunOutcome> {
        let state = self.begin();
        let result = self.replicate(&state);
        if let Err(err) = &result {
            warn!(
                replication_id = %self.config.replication_id,
                batch = state.batches.load(Ordering::SeqCst),
                error = %err,
                "replication run failed"
            );
        }
        state.terminated.store(true, Ordering::SeqCst);
        result
    }

    fn replicate(&self, state: &RunState) -> ReplicationResult<RunOutcome> {
        let config = &self.config;
        let settings = &config.settings;
        let id = &config.replication_id;

        let mut since = config.checkpoints.get(id)?.unwrap_or(Sequence::START);
        info!(
            replication_id = %id,
            direction = %config.direction,
            since = %since,
            "replication run started"
        );

        loop {
            let documents = state.documents.load(Ordering::SeqCst);
            if state.cancel.load(Ordering::SeqCst) {
                info!(replication_id = %id, documents, "replication cancelled");
                return Ok(RunOutcome::Cancelled);
            }
            if state.batches.load(Ordering::SeqCst) >= settings.batch_limit_per_run {
                info!(replication_id = %id, documents, "batch limit reached");
                return Ok(RunOutcome::Completed);
            }

            let page = config.source.changes(
                since,
                settings.changes_limit_per_batch,
                config.filter.as_ref(),
            )?;
            if page.is_empty() {
                info!(replication_id = %id, documents, "replication complete");
                return Ok(RunOutcome::Completed);
            }

            let count = self.apply_batch(&page)?;
            config
                .checkpoints
                .put(id, page.last_seq)
                .map_err(|err| match err {
                    ReplicationError::CheckpointPersist(_) => err,
                    other => ReplicationError::CheckpointPersist(other.to_string()),
                })?;
            since = page.last_seq;

            state.documents.fetch_add(count, Ordering::SeqCst);
            let batch = state.batches.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                replication_id = %id,
                batch,
                documents = count,
                since = %since,
                "batch committed"
            );
            config
                .event_bus
                .publish(&ReplicationEvent::BatchCompleted { count });
        }
    }

    /// Diffs, fetches and merges one page. Returns the number of documents
    /// the target reports as changed by the merge.
    fn apply_batch(&self, page: &ChangesResponse) -> ReplicationResult<usize> {
        let config = &self.config;
        let missing = config.target.revs_diff(&page.revisions_by_document())?;
        if missing.is_empty() {
            return Ok(0);
        }

        let items: Vec<BulkGetItem> = missing
            .iter()
            .flat_map(|(id, revs)| revs.iter().map(|rev| BulkGetItem::new(id.clone(), rev.clone())))
            .collect();
        let paths = self.fetch(&items)?;
        config.target.bulk_insert(&paths)
    }

    /// Fetches revision paths in chunks on a bounded set of worker threads.
    ///
    /// Every chunk must succeed; results keep the order of `items`. Once a
    /// chunk fails no worker claims another one.
    fn fetch(&self, items: &[BulkGetItem]) -> ReplicationResult<Vec<DocumentRevs>> {
        let settings = &self.config.settings;
        let chunks: Vec<&[BulkGetItem]> = items.chunks(settings.insert_batch_size).collect();
        let workers = settings.worker_threads.min(chunks.len()).max(1);
        let cursor = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let (next, failed, chunks) = (&cursor, &failed, &chunks);

        let joined = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        let mut done = Vec::new();
                        while !failed.load(Ordering::SeqCst) {
                            let index = next.fetch_add(1, Ordering::SeqCst);
                            let Some(chunk) = chunks.get(index) else {
                                break;
                            };
                            let result = self.fetch_chunk(chunk);
                            if result.is_err() {
                                failed.store(true, Ordering::SeqCst);
                            }
                            done.push((index, result));
                        }
                        done
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        });

        let mut results = Vec::with_capacity(chunks.len());
        for outcome in joined {
            match outcome {
                Ok(done) => results.extend(done),
                Err(_) => return Err(ReplicationError::Panicked("fetch worker".into())),
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let mut paths = Vec::with_capacity(items.len());
        for (_, result) in results {
            paths.extend(result?);
        }
        Ok(paths)
    }

    fn fetch_chunk(&self, chunk: &[BulkGetItem]) -> ReplicationResult<Vec<DocumentRevs>> {
        let retry = &self.config.settings.retry;
        let mut attempt = 0;
        loop {
            let fetched = self
                .config
                .source
                .bulk_get(chunk)
                .and_then(|paths| ensure_complete(chunk, paths));
            match fetched {
                Ok(paths) => return Ok(paths),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    warn!(
                        replication_id = %self.config.replication_id,
                        attempt,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    thread::sleep(retry.delay_for_attempt(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Checks that every requested revision came back as the leaf of a path.
fn ensure_complete(
    requested: &[BulkGetItem],
    paths: Vec<DocumentRevs>,
) -> ReplicationResult<Vec<DocumentRevs>> {
    let absent = {
        let returned: HashSet<(&str, &RevisionId)> = paths
            .iter()
            .filter_map(|path| path.leaf().map(|leaf| (path.id.as_str(), &leaf.id)))
            .collect();
        requested
            .iter()
            .filter(|item| !returned.contains(&(item.id.as_str(), &item.rev)))
            .count()
    };
    if absent > 0 {
        return Err(ReplicationError::network_retryable(format!(
            "bulk get returned {} of {} requested revisions",
            requested.len() - absent,
            requested.len()
        )));
    }
    Ok(paths)
}

macro_rules! forward_strategy {
    ($name:ident) => {
        impl ReplicationStrategy for $name {
            fn run(&self) -> ReplicationResult<RunOutcome> {
                self.0.execute()
            }

            fn request_cancel(&self) {
                self.0.current().cancel.store(true, Ordering::SeqCst);
            }

            fn is_cancel_requested(&self) -> bool {
                self.0.current().cancel.load(Ordering::SeqCst)
            }

            fn is_terminated(&self) -> bool {
                self.0.current().terminated.load(Ordering::SeqCst)
            }

            fn event_bus(&self) -> &Arc<EventBus> {
                &self.0.config.event_bus
            }

            fn replication_id(&self) -> &ReplicationId {
                &self.0.config.replication_id
            }

            fn document_counter(&self) -> usize {
                self.0.current().documents.load(Ordering::SeqCst)
            }

            fn batch_counter(&self) -> usize {
                self.0.current().batches.load(Ordering::SeqCst)
            }

            fn remote_descriptor(&self) -> &Url {
                &self.0.config.remote
            }
        }
    };
}

/// Copies remote changes into the local store.
pub struct PullStrategy(ReplicationRun);

impl PullStrategy {
    /// Creates a pull strategy.
    pub fn new(config: Arc<ReplicationConfig>) -> Self {
        Self(ReplicationRun::new(config))
    }

    /// Returns the filter applied to the remote changes feed.
    pub fn filter(&self) -> Option<&PullFilter> {
        self.0.config.filter.as_ref()
    }
}

forward_strategy!(PullStrategy);

/// Copies local changes to the remote database.
pub struct PushStrategy(ReplicationRun);

impl PushStrategy {
    /// Creates a push strategy.
    pub fn new(config: Arc<ReplicationConfig>) -> Self {
        Self(ReplicationRun::new(config))
    }
}

forward_strategy!(PushStrategy);

/// A pull or push strategy.
pub enum Strategy {
    /// Remote to local.
    Pull(PullStrategy),
    /// Local to remote.
    Push(PushStrategy),
}

impl Strategy {
    /// Creates the strategy matching the configured direction.
    pub fn new(config: Arc<ReplicationConfig>) -> Self {
        match config.direction {
            Direction::Pull => Strategy::Pull(PullStrategy::new(config)),
            Direction::Push => Strategy::Push(PushStrategy::new(config)),
        }
    }

    /// Returns the direction.
    pub fn direction(&self) -> Direction {
        match self {
            Strategy::Pull(_) => Direction::Pull,
            Strategy::Push(_) => Direction::Push,
        }
    }

    fn inner(&self) -> &dyn ReplicationStrategy {
        match self {
            Strategy::Pull(strategy) => strategy,
            Strategy::Push(strategy) => strategy,
        }
    }
}

impl ReplicationStrategy for Strategy {
    fn run(&self) -> ReplicationResult<RunOutcome> {
        self.inner().run()
    }

    fn request_cancel(&self) {
        self.inner().request_cancel()
    }

    fn is_cancel_requested(&self) -> bool {
        self.inner().is_cancel_requested()
    }

    fn is_terminated(&self) -> bool {
        self.inner().is_terminated()
    }

    fn event_bus(&self) -> &Arc<EventBus> {
        self.inner().event_bus()
    }

    fn replication_id(&self) -> &ReplicationId {
        self.inner().replication_id()
    }

    fn document_counter(&self) -> usize {
        self.inner().document_counter()
    }

    fn batch_counter(&self) -> usize {
        self.inner().batch_counter()
    }

    fn remote_descriptor(&self) -> &Url {
        self.inner().remote_descriptor()
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("direction", &self.direction())
            .field("replication_id", self.replication_id())
            .field("documents", &self.document_counter())
            .field("batches", &self.batch_counter())
            .finish()
    }
}
