//! Lifecycle signals and the subscriber list each node fans them out to.
//!
//! Parents subscribe to their children here, and so do sinks. Delivery is
//! synchronous, on whichever task emitted the signal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::value::Value;

/// Unique identifier for a subscription.
///
/// Returned by [`Node::subscribe`](super::Node::subscribe) and used to
/// unsubscribe again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A lifecycle signal emitted by a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// The node went from clean to dirty.
    Dirty,
    /// The node settled with a freshly computed value.
    Update(Value),
    /// The node was disposed. Emitted once.
    Remove,
}

impl NodeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::Dirty => "dirty",
            NodeEvent::Update(_) => "update",
            NodeEvent::Remove => "remove",
        }
    }
}

pub(crate) type Listener = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// The listeners registered on one node.
#[derive(Default)]
pub(crate) struct Subscribers {
    entries: RwLock<Vec<(SubscriberId, Listener)>>,
}

impl Subscribers {
    pub(crate) fn add(&self, listener: Listener) -> SubscriberId {
        let id = SubscriberId::new();
        self.entries.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Deliver `event` to every listener.
    ///
    /// The list is snapshotted first, so a listener may unsubscribe itself
    /// (sinks do this on `Remove`) without deadlocking.
    pub(crate) fn emit(&self, event: &NodeEvent) {
        let snapshot: SmallVec<[Listener; 4]> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}
