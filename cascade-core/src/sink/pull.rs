//! Request/response access to settled values.

use crate::graph::Node;
use crate::value::Value;

/// Answers requests for a node's value, holding them while it is dirty.
///
/// This is the piece an HTTP handler wraps: respond with the cached value
/// if the node is clean, otherwise with the value of its next update.
#[derive(Debug, Clone)]
pub struct PullSink {
    node: Node,
}

impl PullSink {
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// `None` once the node is disposed; a request should then fall through
    /// to whatever handles missing content.
    ///
    /// Waits indefinitely if the node's derivation keeps failing, so callers
    /// serving requests wrap this in a timeout.
    pub async fn respond(&self) -> Option<Value> {
        self.node.settled().await
    }
}
