//! Resource nodes: graph leaves whose value is the content of a watched file.
//!
//! Resource nodes are obtained from a [`ResourceRegistry`], never built
//! directly, so that every reference to one path shares a single node, a
//! single OS watch and a single cached read.

mod registry;

pub use registry::ResourceRegistry;

use registry::RegistryInner;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::config::WatchOptions;
use crate::error::{Error, Result};
use crate::graph::{Compute, Node};
use crate::value::Value;
use crate::watch::{Change, WatchShim};

/// How the raw bytes of a resource become a node value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Raw bytes, unchanged.
    #[default]
    Bytes,
    /// UTF-8 text. Invalid UTF-8 fails the derivation.
    Text,
}

impl Encoding {
    pub fn interpret(self, path: &Path, bytes: Vec<u8>) -> Result<Value> {
        match self {
            Encoding::Bytes => Ok(Value::Bytes(bytes)),
            Encoding::Text => String::from_utf8(bytes).map(Value::Text).map_err(|err| {
                Error::derive(format!("[Resource {}]", path.display()), err)
            }),
        }
    }
}

/// Compute hook for a watched file.
pub struct ResourceNode {
    path: PathBuf,
    encoding: Encoding,
    options: WatchOptions,
    shim: Arc<WatchShim>,
    registry: Weak<RegistryInner>,
}

impl ResourceNode {
    fn new(
        path: PathBuf,
        encoding: Encoding,
        options: WatchOptions,
        shim: Arc<WatchShim>,
        registry: Weak<RegistryInner>,
    ) -> Self {
        Self {
            path,
            encoding,
            options,
            shim,
            registry,
        }
    }
}

impl Compute for ResourceNode {
    fn kind(&self) -> &'static str {
        "Resource"
    }

    fn label(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }

    fn derive<'a>(&'a self, _inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        Box::pin(self.shim.read_through(&self.path, self.encoding))
    }

    fn on_init(&self, node: &Node) -> Result<()> {
        let weak = node.downgrade();
        self.shim
            .watch(&self.path, self.options, move |_: &Change| {
                if let Some(node) = weak.upgrade() {
                    node.dirty_detached();
                }
            })?;
        debug!(node = %node.name(), "watching");
        Ok(())
    }

    fn on_release(&self, node: &Node) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.drop_ref(&self.path, node),
            None => true,
        }
    }

    fn on_dispose(&self, _node: &Node) {
        self.shim.unwatch(&self.path, None);
    }
}
