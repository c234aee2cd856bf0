//! The capability a node kind supplies to the shared state machine.
//!
//! A [`Node`] owns the dirty/update/init bookkeeping; a [`Compute`]
//! implementation only says how to turn clean child values into a value, and
//! what to set up and tear down around that.

use futures_util::future::{self, BoxFuture};

use super::Node;
use crate::error::Result;
use crate::value::Value;

/// Node-specific behaviour plugged into the graph state machine.
pub trait Compute: Send + Sync + 'static {
    /// Short kind name used in node names, e.g. `Json` in `[Json]`.
    fn kind(&self) -> &'static str {
        "Node"
    }

    /// Optional label appended to the kind, e.g. a file path.
    fn label(&self) -> Option<String> {
        None
    }

    /// Produce this node's value from its children's current values.
    ///
    /// Called only when every child is clean; `inputs` holds the children's
    /// cached values in the order they were added.
    fn derive<'a>(&'a self, inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        let _ = inputs;
        Box::pin(future::ready(Ok(Value::Null)))
    }

    /// Setup run once during `init`, after the children are initialized.
    fn on_init(&self, node: &Node) -> Result<()> {
        let _ = node;
        Ok(())
    }

    /// Called on every `dispose` before teardown. Returning `false` drops
    /// only the caller's reference and keeps a shared node alive.
    fn on_release(&self, node: &Node) -> bool {
        let _ = node;
        true
    }

    /// Teardown run once on dispose.
    fn on_dispose(&self, node: &Node) {
        let _ = node;
    }
}

/// Compute with every hook left at its default: derives `Value::Null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Empty;

impl Compute for Empty {}

/// Compute backed by a synchronous closure.
pub struct FnCompute<F> {
    kind: &'static str,
    derive: F,
}

impl<F> FnCompute<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
{
    pub fn new(derive: F) -> Self {
        Self {
            kind: "Node",
            derive,
        }
    }

    pub fn with_kind(kind: &'static str, derive: F) -> Self {
        Self { kind, derive }
    }
}

impl<F> Compute for FnCompute<F>
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
{
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn derive<'a>(&'a self, inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        Box::pin(future::ready((self.derive)(inputs)))
    }
}
