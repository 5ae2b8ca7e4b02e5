//! Lifecycle event subscription and dispatch
//!
//! An [`EventBus`] keeps one listener list per [`ExecutionKind`]. Every data
//! source owns an instance-level bus and holds a handle to a process-wide bus
//! (by default [`EventBus::global`]). Injecting a private bus in place of the
//! global one keeps tests isolated from each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::event::{ExecutionEvent, ExecutionKind};

/// Callback invoked for each dispatched event
pub type Listener = Arc<dyn Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

static GLOBAL_BUS: Lazy<Arc<EventBus>> = Lazy::new(|| Arc::new(EventBus::new()));

#[derive(Default)]
struct ListenerList {
    entries: RwLock<Vec<(SubscriptionId, Listener)>>,
}

impl ListenerList {
    fn push(&self, id: SubscriptionId, listener: Listener) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, listener));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Copy the listeners out so no lock is held while they run
    fn snapshot(&self) -> Vec<Listener> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

/// Multicast event bus with one listener list per lifecycle kind
#[derive(Default)]
pub struct EventBus {
    started: ListenerList,
    finished: ListenerList,
    canceled: ListenerList,
    errored: ListenerList,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus. Subscriptions here live until explicitly removed.
    pub fn global() -> Arc<EventBus> {
        GLOBAL_BUS.clone()
    }

    fn list(&self, kind: ExecutionKind) -> &ListenerList {
        match kind {
            ExecutionKind::Started => &self.started,
            ExecutionKind::Finished => &self.finished,
            ExecutionKind::Canceled => &self.canceled,
            ExecutionKind::Errored => &self.errored,
        }
    }

    /// Register a listener for one event kind
    pub fn subscribe<F>(&self, kind: ExecutionKind, listener: F) -> SubscriptionId
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.list(kind).push(id, Arc::new(listener));
        debug!("Subscribed {:?} to {} events", id, kind);
        id
    }

    pub fn on_started<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(ExecutionKind::Started, listener)
    }

    pub fn on_finished<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(ExecutionKind::Finished, listener)
    }

    /// Caller-initiated aborts only; timeouts arrive through [`EventBus::on_error`]
    pub fn on_canceled<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(ExecutionKind::Canceled, listener)
    }

    pub fn on_error<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(ExecutionKind::Errored, listener)
    }

    /// Remove a subscription. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = ExecutionKind::ALL
            .iter()
            .any(|kind| self.list(*kind).remove(id));
        if removed {
            debug!("Unsubscribed {:?}", id);
        }
        removed
    }

    pub fn listener_count(&self, kind: ExecutionKind) -> usize {
        self.list(kind).len()
    }

    /// Deliver an event to every listener of its kind, in subscription order.
    ///
    /// The first listener error stops the dispatch and is returned.
    pub fn dispatch(&self, event: &ExecutionEvent) -> Result<()> {
        let kind = event.kind();
        for listener in self.list(kind).snapshot() {
            listener(event).map_err(|source| QueryError::Subscriber { kind, source })?;
        }
        Ok(())
    }
}
