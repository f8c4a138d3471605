//! The replicator facade and its state machine.

use crate::config::Direction;
use crate::cookie::CookieInterceptor;
use crate::error::{ReplicationError, ReplicationResult};
use crate::event::{EventBus, ReplicationEvent};
use crate::replication_id::ReplicationId;
use crate::strategy::{ReplicationConfig, ReplicationStrategy, RunOutcome, Strategy};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

/// Lifecycle state of a [`Replicator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Built but never started.
    Pending,
    /// A run is in progress.
    Started,
    /// Stop was requested and the run is finishing its current batch.
    Stopping,
    /// The last run reached the end of the changes feed.
    Complete,
    /// The last run failed.
    Error,
    /// The last run was stopped early.
    Cancelled,
}

impl ReplicatorState {
    /// Returns true if a run is in progress.
    pub fn is_running(&self) -> bool {
        matches!(self, ReplicatorState::Started | ReplicatorState::Stopping)
    }

    /// Returns true if the last run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicatorState::Complete | ReplicatorState::Error | ReplicatorState::Cancelled
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            ReplicatorState::Pending => "pending",
            ReplicatorState::Started => "started",
            ReplicatorState::Stopping => "stopping",
            ReplicatorState::Complete => "complete",
            ReplicatorState::Error => "error",
            ReplicatorState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Shared {
    state: RwLock<ReplicatorState>,
    strategy: RwLock<Option<Arc<Strategy>>>,
}

/// Supervises replication runs for one configuration.
///
/// Each [`start`](Self::start) spawns a dedicated thread running a fresh
/// strategy. Runs of the same replicator share the configuration, the
/// event bus and the checkpoint, so a stopped or failed replication picks
/// up where it left off.
pub struct Replicator {
    config: Arc<ReplicationConfig>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    pub(crate) fn new(config: ReplicationConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(Shared {
                state: RwLock::new(ReplicatorState::Pending),
                strategy: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts a new run in the background.
    ///
    /// Fails with [`ReplicationError::IllegalState`] while a run is in
    /// progress.
    pub fn start(&self) -> ReplicationResult<()> {
        let strategy = {
            let mut state = self.shared.state.write();
            if state.is_running() {
                return Err(ReplicationError::IllegalState {
                    from: state.to_string(),
                    operation: "start",
                });
            }
            let strategy = Arc::new(Strategy::new(Arc::clone(&self.config)));
            *self.shared.strategy.write() = Some(Arc::clone(&strategy));
            *state = ReplicatorState::Started;
            strategy
        };

        info!(
            replication_id = %self.config.replication_id,
            direction = %self.config.direction,
            remote = %self.config.remote,
            "replicator started"
        );
        self.config.event_bus.publish(&ReplicationEvent::Started);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("docsync-{}", self.config.direction))
            .spawn(move || Self::supervise(&shared, &strategy));

        match spawned {
            Ok(handle) => {
                // The previous worker has already finished; dropping its
                // handle detaches it.
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                *self.shared.state.write() = ReplicatorState::Error;
                let cause = std::io::Error::new(err.kind(), err.to_string());
                self.config.event_bus.publish(&ReplicationEvent::Errored {
                    cause: Arc::new(ReplicationError::Io(cause)),
                });
                Err(ReplicationError::Io(err))
            }
        }
    }

    fn supervise(shared: &Shared, strategy: &Strategy) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| strategy.run())).unwrap_or_else(
            |payload| Err(ReplicationError::Panicked(panic_message(&*payload))),
        );
        let document_count = strategy.document_counter();
        let (state, event) = match result {
            Ok(RunOutcome::Completed) => (
                ReplicatorState::Complete,
                ReplicationEvent::Completed { document_count },
            ),
            Ok(RunOutcome::Cancelled) => (
                ReplicatorState::Cancelled,
                ReplicationEvent::Cancelled { document_count },
            ),
            Err(err) => (
                ReplicatorState::Error,
                ReplicationEvent::Errored {
                    cause: Arc::new(err),
                },
            ),
        };

        *shared.state.write() = state;
        debug!(
            replication_id = %strategy.replication_id(),
            state = %state,
            documents = document_count,
            "replicator finished"
        );
        let bus = strategy.event_bus();
        let published = panic::catch_unwind(AssertUnwindSafe(|| bus.publish(&event)));
        if let Err(payload) = published {
            warn!(
                replication_id = %strategy.replication_id(),
                panic = %panic_message(&*payload),
                "listener panicked on terminal event"
            );
        }
    }

    /// Requests the running replication to stop after its current batch.
    ///
    /// Has no effect unless the replicator is started.
    pub fn stop(&self) {
        let mut state = self.shared.state.write();
        if *state != ReplicatorState::Started {
            return;
        }
        if let Some(strategy) = self.shared.strategy.read().as_ref() {
            strategy.request_cancel();
        }
        *state = ReplicatorState::Stopping;
        info!(replication_id = %self.config.replication_id, "replicator stopping");
    }

    /// Returns the current state.
    pub fn state(&self) -> ReplicatorState {
        *self.shared.state.read()
    }

    /// Blocks until the current run ends and returns the final state.
    ///
    /// Called from a `Started` listener it returns at once: the worker is
    /// spawned only after that event has been delivered.
    pub fn wait(&self) -> ReplicatorState {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                let mut state = self.shared.state.write();
                if state.is_running() {
                    *state = ReplicatorState::Error;
                }
            }
        }
        self.state()
    }

    /// Returns the event bus. The same bus is used by every run.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.config.event_bus
    }

    /// Returns the strategy of the latest run, if any.
    pub fn strategy(&self) -> Option<Arc<Strategy>> {
        self.shared.strategy.read().clone()
    }

    /// Returns the replication id.
    pub fn replication_id(&self) -> &ReplicationId {
        &self.config.replication_id
    }

    /// Returns the direction.
    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    /// Returns the credential-free remote URL.
    pub fn remote_descriptor(&self) -> &Url {
        &self.config.remote
    }

    /// Returns the session interceptor created from URL credentials.
    pub fn session_interceptor(&self) -> Option<&Arc<CookieInterceptor>> {
        self.config.session()
    }

    /// Returns the shared configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
