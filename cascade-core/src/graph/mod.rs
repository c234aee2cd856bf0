//! Dependency Graph
//!
//! This module implements the incremental computation graph: nodes that cache
//! a value derived from their children and recompute when a child changes.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Leaves observe something external (a watched file, see
//!   [`resource`](crate::resource)).
//! - Internal nodes derive a value from their children's cached values.
//! - Edges are listener subscriptions: a parent listens to each child's
//!   `Dirty` and `Update` signals.
//!
//! Dirtiness flows up synchronously the moment a leaf changes. Recomputation
//! then proceeds from the leaves upwards: a node only derives once every
//! child is clean, and each settled child pokes its parents to try again.
//!
//! # Guarantees
//!
//! 1. At most one derivation is in flight per node (`updating` is a mutual
//!    exclusion flag, not a queue).
//! 2. A node never emits `Update` while it or any child is dirty.
//! 3. A change that lands during a derivation is never lost: it forces one
//!    more derivation, which absorbs every change from that window.
//! 4. A disposed node does no further dirty or update processing.
//!
//! # Design Decisions
//!
//! 1. Nodes are handles (`Arc` inside) so a child can be shared by several
//!    parents. Parents hold children strongly; a child's listener holds its
//!    parent weakly, so there is no reference cycle.
//!
//! 2. Node-specific behaviour is a [`Compute`] implementation composed into
//!    the shared state machine, rather than a subclass of it.
//!
//! 3. Timestamps come from a process-wide logical clock, so "dirtied after
//!    the derivation started" is a strict comparison that cannot tie.

mod compute;
mod node;
mod subscriber;

pub use compute::{Compute, Empty, FnCompute};
pub use node::{Node, NodeId, Stamp, WeakNode};
pub use subscriber::{NodeEvent, SubscriberId};
