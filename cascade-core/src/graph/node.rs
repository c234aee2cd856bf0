//! Graph Nodes
//!
//! A [`Node`] holds a cached value derived from its children and runs the
//! dirty/update/init/dispose state machine around a [`Compute`] hook.
//!
//! # Update protocol
//!
//! 1. `dirty` stamps `last_dirty`, flips the node dirty and emits `Dirty`,
//!    which synchronously marks every ancestor dirty as well.
//! 2. `update` refuses to run while the node is clean, already updating, or
//!    any child is dirty. Otherwise it sets `updating`, stamps
//!    `last_updated` and derives.
//! 3. On commit the value is cached. If nothing dirtied the node after the
//!    derivation started (`last_updated >= last_dirty`) and no child is
//!    dirty, the node settles and emits `Update`. Otherwise it derives again.
//!
//! `last_updated` is stamped *before* deriving, so a `dirty` landing
//! mid-derivation always compares greater and forces exactly one more pass.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{try_join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, trace, warn};

use super::compute::{Compute, Empty, FnCompute};
use super::subscriber::{NodeEvent, SubscriberId, Subscribers};
use crate::error::{Error, Result};
use crate::value::Value;

/// Capacity of the per-node event channel used by async observers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// A point on the process-wide logical clock.
///
/// Every call to [`Stamp::now`] returns a value strictly greater than all
/// earlier ones, on any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(u64);

impl Stamp {
    /// Earlier than every stamp handed out by [`Stamp::now`].
    pub const ZERO: Stamp = Stamp(0);

    pub fn now() -> Self {
        static CLOCK: AtomicU64 = AtomicU64::new(1);
        Self(CLOCK.fetch_add(1, Ordering::Relaxed))
    }
}

/// Mutable lifecycle state, guarded by the node's lock.
#[derive(Debug)]
struct NodeState {
    initialized: bool,
    dirty: bool,
    updating: bool,
    disposed: bool,
    last_dirty: Stamp,
    last_updated: Stamp,
    cached: Option<Value>,
}

/// What a `dirty` call decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Marked {
    /// Uninitialized, disposed, or mid-derivation: the stamp is all that
    /// matters, the in-flight pass will pick it up.
    Skip,
    /// Already dirty and idle: attempt an update, but don't re-signal.
    Pending,
    /// Went clean to dirty.
    Fresh,
}

/// A child and this node's listener on it.
struct Edge {
    child: Node,
    listener: SubscriberId,
}

struct NodeInner {
    id: NodeId,
    name: String,
    compute: Box<dyn Compute>,
    state: Mutex<NodeState>,
    children: RwLock<SmallVec<[Edge; 4]>>,
    subscribers: Subscribers,
    events: broadcast::Sender<NodeEvent>,
    init_once: OnceCell<()>,
}

/// A non-owning handle to a [`Node`].
#[derive(Clone)]
pub struct WeakNode {
    inner: Weak<NodeInner>,
}

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.inner.upgrade().map(|inner| Node { inner })
    }
}

/// A node in the dependency graph.
///
/// `Node` is a cheap handle; clones share the same node. A node is created
/// detached and dirty, wired to its children with [`Node::add_child`],
/// initialized once with [`Node::init`] and disposed at most once.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node around the given compute hook.
    pub fn new(compute: impl Compute) -> Self {
        Self::build(None, Box::new(compute))
    }

    /// Create a node whose name carries an explicit label.
    pub fn with_name(label: impl Into<String>, compute: impl Compute) -> Self {
        Self::build(Some(label.into()), Box::new(compute))
    }

    /// Create a node deriving its value with a synchronous closure over the
    /// children's values.
    pub fn from_fn<F>(derive: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(FnCompute::new(derive))
    }

    /// A node whose value is always `Value::Null`.
    pub fn empty() -> Self {
        Self::new(Empty)
    }

    fn build(label: Option<String>, compute: Box<dyn Compute>) -> Self {
        let name = match label.or_else(|| compute.label()) {
            Some(label) => format!("[{} {}]", compute.kind(), label),
            None => format!("[{}]", compute.kind()),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(NodeInner {
                id: NodeId::new(),
                name,
                compute,
                state: Mutex::new(NodeState {
                    initialized: false,
                    dirty: true,
                    updating: false,
                    disposed: false,
                    last_dirty: Stamp::now(),
                    last_updated: Stamp::ZERO,
                    cached: None,
                }),
                children: RwLock::new(SmallVec::new()),
                subscribers: Subscribers::default(),
                events,
                init_once: OnceCell::new(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Display name, `[Kind]` or `[Kind label]`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the last successfully derived value.
    pub fn cached(&self) -> Option<Value> {
        self.inner.state.lock().cached.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().dirty
    }

    pub fn is_updating(&self) -> bool {
        self.inner.state.lock().updating
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub fn last_dirty(&self) -> Stamp {
        self.inner.state.lock().last_dirty
    }

    pub fn last_updated(&self) -> Stamp {
        self.inner.state.lock().last_updated
    }

    pub fn children(&self) -> SmallVec<[Node; 4]> {
        self.inner
            .children
            .read()
            .iter()
            .map(|edge| edge.child.clone())
            .collect()
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether `other` is a handle to this same node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    /// Register a listener for this node's lifecycle signals.
    ///
    /// The listener runs synchronously on the emitting task. Sinks should
    /// unsubscribe when they see [`NodeEvent::Remove`]; disposal drops any
    /// listeners that are left.
    pub fn subscribe<F>(&self, listener: F) -> SubscriberId
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.inner.subscribers.add(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.subscribers.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// A channel of this node's signals for async observers.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve with the node's value once it is settled.
    ///
    /// Returns the cached value straight away when the node is clean,
    /// otherwise waits for the next `Update`. Returns `None` if the node is
    /// or becomes disposed. A node whose derivation keeps failing never
    /// settles; callers pick their own timeout.
    pub async fn settled(&self) -> Option<Value> {
        let mut events = self.events();
        loop {
            {
                let state = self.inner.state.lock();
                if state.disposed {
                    return None;
                }
                if !state.dirty {
                    if let Some(value) = &state.cached {
                        return Some(value.clone());
                    }
                }
            }
            match events.recv().await {
                Ok(NodeEvent::Update(value)) => return Some(value),
                Ok(NodeEvent::Remove) | Err(broadcast::error::RecvError::Closed) => return None,
                Ok(NodeEvent::Dirty) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        trace!(node = %self.name(), event = event.kind(), "emit");
        self.inner.subscribers.emit(&event);
        if self.inner.events.receiver_count() > 0 {
            let _ = self.inner.events.send(event);
        }
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    /// Register `child` as a dependency of this node.
    ///
    /// A child going dirty marks this node dirty; a child settling triggers
    /// an update attempt here. Children are fixed for the node's lifetime and
    /// should be added before `init`.
    pub fn add_child(&self, child: &Node) {
        if self.is_initialized() {
            warn!(
                node = %self.name(),
                child = %child.name(),
                "child added after init; it will not be initialized implicitly"
            );
        }

        let parent = self.downgrade();
        let listener = child.subscribe(move |event| {
            let Some(parent) = parent.upgrade() else {
                return;
            };
            match event {
                // The child is dirty, so an update attempt here would be
                // refused; the child's own Update signal retries us.
                NodeEvent::Dirty => {
                    parent.mark_dirty();
                }
                NodeEvent::Update(_) => parent.spawn_update(),
                NodeEvent::Remove => {}
            }
        });

        self.inner.children.write().push(Edge {
            child: child.clone(),
            listener,
        });
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initialize this node and, first, all of its children.
    ///
    /// Idempotent: once an init has completed, later calls return `Ok`
    /// immediately. Concurrent calls (a child shared by two parents) wait on
    /// the first one, so the setup hook runs at most once.
    pub fn init(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner
                .init_once
                .get_or_try_init(|| self.run_init())
                .await
                .map(|_| ())
        })
    }

    async fn run_init(&self) -> Result<()> {
        if self.is_disposed() {
            debug!(node = %self.name(), "init on disposed node ignored");
            return Ok(());
        }

        let children = self.children();
        try_join_all(children.iter().map(|child| child.init()))
            .await
            .map_err(|err| Error::init(self.name(), err))?;

        // A previous attempt may have failed in its initial update, after the
        // setup hook had already run.
        if !self.is_initialized() {
            self.inner
                .compute
                .on_init(self)
                .map_err(|err| Error::init(self.name(), err))?;
            self.inner.state.lock().initialized = true;
            debug!(node = %self.name(), children = children.len(), "initialized");
        }

        self.update().await
    }

    /// Mark this node stale and attempt to recompute it.
    ///
    /// A no-op before `init` and after `dispose`. While a derivation is in
    /// flight only the timestamp moves; that derivation notices and runs
    /// once more.
    pub async fn dirty(&self) -> Result<()> {
        match self.mark_dirty() {
            Marked::Skip => Ok(()),
            Marked::Pending | Marked::Fresh => self.update().await,
        }
    }

    /// `dirty` for callers that cannot await: the node and its ancestors are
    /// dirty when this returns, the update attempt runs as its own task.
    pub(crate) fn dirty_detached(&self) {
        if self.mark_dirty() != Marked::Skip {
            self.spawn_update();
        }
    }

    /// The synchronous half of `dirty`: stamp, flag and signal.
    pub(crate) fn mark_dirty(&self) -> Marked {
        let marked = {
            let mut state = self.inner.state.lock();
            if state.disposed || !state.initialized {
                Marked::Skip
            } else {
                state.last_dirty = Stamp::now();
                if state.updating {
                    Marked::Skip
                } else if state.dirty {
                    Marked::Pending
                } else {
                    state.dirty = true;
                    Marked::Fresh
                }
            }
        };

        if marked == Marked::Fresh {
            debug!(node = %self.name(), "dirty");
            self.emit(NodeEvent::Dirty);
        }
        marked
    }

    /// Recompute this node if it is dirty and every child is clean.
    ///
    /// Returns `Ok` without doing anything when the node is clean, already
    /// updating, waiting on a dirty child, uninitialized or disposed.
    /// Derivation errors are returned to the caller; the node stays dirty
    /// and can be retried.
    pub async fn update(&self) -> Result<()> {
        loop {
            let Some(inputs) = self.begin_update() else {
                return Ok(());
            };

            trace!(node = %self.name(), inputs = inputs.len(), "deriving");
            match self.inner.compute.derive(&inputs).await {
                Ok(value) => {
                    if self.commit(value) {
                        return Ok(());
                    }
                    debug!(node = %self.name(), "dirtied during derivation, deriving again");
                }
                Err(err) => {
                    self.inner.state.lock().updating = false;
                    debug!(node = %self.name(), error = %err, "derivation failed");
                    return Err(err);
                }
            }
        }
    }

    /// Claim the derivation slot and snapshot the children's values.
    ///
    /// The child check, the snapshot and the `last_updated` stamp happen
    /// under this node's lock, so a child dirtying afterwards always stamps
    /// `last_dirty` later than `last_updated`.
    fn begin_update(&self) -> Option<Vec<Value>> {
        let children = self.children();
        let mut state = self.inner.state.lock();
        if !state.initialized || state.disposed || !state.dirty || state.updating {
            return None;
        }

        let mut inputs = Vec::with_capacity(children.len());
        for child in &children {
            let child_state = child.inner.state.lock();
            if child_state.dirty {
                trace!(node = %self.name(), child = %child.name(), "waiting on dirty child");
                return None;
            }
            inputs.push(child_state.cached.clone().unwrap_or_default());
        }

        state.updating = true;
        state.last_updated = Stamp::now();
        Some(inputs)
    }

    /// Record a derived value. Returns `true` when the update cycle is over,
    /// `false` when the node must derive again.
    fn commit(&self, value: Value) -> bool {
        let children = self.children();
        let settled = {
            let mut state = self.inner.state.lock();
            state.updating = false;
            if state.disposed {
                debug!(node = %self.name(), "discarding value derived after dispose");
                return true;
            }

            state.cached = Some(value.clone());
            let children_clean = children.iter().all(|child| !child.inner.state.lock().dirty);
            if state.last_updated >= state.last_dirty && children_clean {
                state.dirty = false;
                true
            } else {
                false
            }
        };

        if settled {
            debug!(node = %self.name(), value = %value.describe(), "update");
            self.emit(NodeEvent::Update(value));
        }
        settled
    }

    /// Fire-and-forget update attempt, used when a child settles.
    fn spawn_update(&self) {
        if !self.is_initialized() || self.is_disposed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let node = self.clone();
                handle.spawn(async move {
                    if let Err(err) = node.update().await {
                        warn!(node = %node.name(), error = %err, "update failed");
                    }
                });
            }
            Err(_) => {
                warn!(node = %self.name(), "no async runtime; dropping update attempt");
            }
        }
    }

    /// Tear the node down: run the teardown hook, emit `Remove`, drop every
    /// subscriber and detach from the children. Idempotent.
    ///
    /// A shared node whose [`Compute::on_release`] reports other holders
    /// only gives up the caller's reference and stays live.
    ///
    /// Safe while a derivation is in flight; its result is discarded.
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        if !self.inner.compute.on_release(self) {
            debug!(node = %self.name(), "reference released, still shared");
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }

        self.inner.compute.on_dispose(self);
        debug!(node = %self.name(), "disposed");
        self.emit(NodeEvent::Remove);
        self.inner.subscribers.clear();

        let edges = std::mem::take(&mut *self.inner.children.write());
        for edge in edges {
            edge.child.unsubscribe(edge.listener);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("initialized", &state.initialized)
            .field("dirty", &state.dirty)
            .field("updating", &state.updating)
            .field("disposed", &state.disposed)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
