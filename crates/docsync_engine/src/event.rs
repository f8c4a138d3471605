//! Replication progress events.

use crate::error::ReplicationError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event published while a replication runs.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// A run began.
    Started,
    /// A batch was applied and checkpointed.
    BatchCompleted {
        /// Documents replicated by this batch.
        count: usize,
    },
    /// The run reached the end of the source's changes feed, or its batch
    /// limit.
    Completed {
        /// Documents replicated by the run.
        document_count: usize,
    },
    /// The run stopped early on request.
    Cancelled {
        /// Documents replicated before stopping.
        document_count: usize,
    },
    /// The run failed.
    Errored {
        /// What went wrong.
        cause: Arc<ReplicationError>,
    },
}

impl ReplicationEvent {
    /// Returns true for events that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicationEvent::Completed { .. }
                | ReplicationEvent::Cancelled { .. }
                | ReplicationEvent::Errored { .. }
        )
    }
}

/// Receives replication events.
///
/// Called synchronously on the publishing thread.
pub trait ReplicationListener: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &ReplicationEvent);
}

impl<F> ReplicationListener for F
where
    F: Fn(&ReplicationEvent) + Send + Sync,
{
    fn on_event(&self, event: &ReplicationEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of events to registered listeners.
///
/// Listeners are called in registration order. Delivery works on a
/// snapshot of the listener list, so a listener may register or unregister
/// listeners (itself included) while handling an event.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ReplicationListener>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    pub fn register(&self, listener: Arc<dyn ReplicationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Delivers an event to every listener.
    pub fn publish(&self, event: &ReplicationEvent) {
        let snapshot: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener.on_event(event);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns a channel receiving every event published from now on.
    ///
    /// The listener is dropped from the bus once the receiver is gone and
    /// the next event fails to send.
    pub fn subscribe(self: &Arc<Self>) -> mpsc::UnboundedReceiver<ReplicationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::downgrade(self);
        let slot: Arc<RwLock<Option<ListenerId>>> = Arc::new(RwLock::new(None));
        let own_id = Arc::clone(&slot);

        let id = self.register(Arc::new(move |event: &ReplicationEvent| {
            if tx.send(event.clone()).is_err() {
                if let (Some(bus), Some(id)) = (bus.upgrade(), *own_id.read()) {
                    bus.unregister(id);
                }
            }
        }));
        *slot.write() = Some(id);
        rx
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
