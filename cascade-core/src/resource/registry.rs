//! Reference-counted sharing of resource nodes by absolute path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{Encoding, ResourceNode};
use crate::config::{CascadeConfig, WatchOptions};
use crate::error::{Error, Result};
use crate::graph::Node;
use crate::watch::WatchShim;

struct Held {
    node: Node,
    encoding: Encoding,
    refs: usize,
}

/// Hands out one shared [`Node`] per watched path.
///
/// Every `acquire` must be balanced by one `release` of the path or one
/// `dispose` of the returned node; the two are interchangeable. The node is
/// disposed, and the OS watch for its path stopped, only when the last
/// reference goes. Every operation on one path is serialized by the map's
/// shard lock.
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<RegistryInner>,
}

pub(super) struct RegistryInner {
    shim: Arc<WatchShim>,
    options: WatchOptions,
    entries: DashMap<PathBuf, Held>,
}

impl ResourceRegistry {
    pub fn new(shim: Arc<WatchShim>, config: &CascadeConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                shim,
                options: config.watch_options(),
                entries: DashMap::new(),
            }),
        }
    }

    pub fn shim(&self) -> &Arc<WatchShim> {
        &self.inner.shim
    }

    /// Take a reference to the resource node for `path`, creating it on
    /// first use.
    ///
    /// The node is returned uninitialized if new; call `init` on it or on a
    /// parent. Fails with [`Error::EncodingMismatch`] if the path is already
    /// held with a different encoding.
    pub fn acquire(&self, path: impl AsRef<Path>, encoding: Encoding) -> Result<Node> {
        let path = std::path::absolute(path.as_ref()).map_err(|source| Error::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        match self.inner.entries.entry(path.clone()) {
            Entry::Occupied(mut occupied) => {
                let held = occupied.get_mut();
                if held.encoding != encoding {
                    return Err(Error::EncodingMismatch {
                        path,
                        held: held.encoding,
                        requested: encoding,
                    });
                }
                held.refs += 1;
                Ok(held.node.clone())
            }
            Entry::Vacant(vacant) => {
                let node = self.create(path, encoding);
                vacant.insert(Held {
                    node: node.clone(),
                    encoding,
                    refs: 1,
                });
                Ok(node)
            }
        }
    }

    fn create(&self, path: PathBuf, encoding: Encoding) -> Node {
        let node = Node::new(ResourceNode::new(
            path,
            encoding,
            self.inner.options,
            Arc::clone(&self.inner.shim),
            Arc::downgrade(&self.inner),
        ));
        debug!(node = %node.name(), "resource created");
        node
    }

    /// Drop one reference to `path`. Returns `false` if it was not held.
    pub fn release(&self, path: impl AsRef<Path>) -> bool {
        let Ok(path) = std::path::absolute(path.as_ref()) else {
            return false;
        };

        // Cloned out so disposal runs outside the shard lock.
        let Some(node) = self.inner.entries.get(&path).map(|held| held.node.clone()) else {
            return false;
        };
        node.dispose();
        true
    }

    /// Live references to `path`, zero if not held.
    pub fn ref_count(&self, path: impl AsRef<Path>) -> usize {
        std::path::absolute(path.as_ref())
            .ok()
            .and_then(|path| self.inner.entries.get(&path).map(|held| held.refs))
            .unwrap_or(0)
    }

    /// Number of distinct paths held.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl RegistryInner {
    /// Drop one reference held on `node`. Returns `true` when it was the
    /// last one and the node should be torn down.
    pub(super) fn drop_ref(&self, path: &Path, node: &Node) -> bool {
        match self.entries.entry(path.to_path_buf()) {
            Entry::Occupied(mut occupied) if occupied.get().node.ptr_eq(node) => {
                let held = occupied.get_mut();
                held.refs -= 1;
                if held.refs > 0 {
                    debug!(node = %node.name(), refs = held.refs, "reference released");
                    return false;
                }
                occupied.remove();
                debug!(node = %node.name(), "last reference released");
                true
            }
            _ => true,
        }
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("paths", &self.inner.entries.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::watch::ManualBackend;

    fn registry() -> (ManualBackend, ResourceRegistry) {
        let backend = ManualBackend::new();
        let shim = Arc::new(WatchShim::with_backend(Arc::new(backend.clone())));
        (backend, ResourceRegistry::new(shim, &CascadeConfig::default()))
    }

    #[tokio::test]
    async fn same_path_shares_one_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hi").unwrap();
        let (backend, registry) = registry();

        let a = registry.acquire(&path, Encoding::Text).unwrap();
        let b = registry.acquire(&path, Encoding::Text).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(registry.ref_count(&path), 2);
        assert_eq!(registry.len(), 1);

        a.init().await.unwrap();
        b.init().await.unwrap();
        assert_eq!(backend.started(), 1);
        assert_eq!(a.cached(), Some(Value::from("hi")));
        assert_eq!(a.name(), format!("[Resource {}]", path.display()));
    }

    #[tokio::test]
    async fn watch_stops_only_after_last_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hi").unwrap();
        let (backend, registry) = registry();

        let node = registry.acquire(&path, Encoding::Bytes).unwrap();
        registry.acquire(&path, Encoding::Bytes).unwrap();
        node.init().await.unwrap();

        assert!(registry.release(&path));
        assert_eq!(backend.active(), 1);
        assert!(!node.is_disposed());

        assert!(registry.release(&path));
        assert_eq!(backend.active(), 0);
        assert!(node.is_disposed());
        assert!(registry.is_empty());
        assert!(!registry.release(&path));
    }

    #[tokio::test]
    async fn encoding_mismatch_is_rejected() {
        let (_, registry) = registry();
        registry.acquire("/tmp/cascade-mixed", Encoding::Text).unwrap();

        let err = registry
            .acquire("/tmp/cascade-mixed", Encoding::Bytes)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::EncodingMismatch {
                held: Encoding::Text,
                requested: Encoding::Bytes,
                ..
            }
        ));
        assert_eq!(registry.ref_count("/tmp/cascade-mixed"), 1);
    }

    #[tokio::test]
    async fn disposing_a_shared_handle_keeps_the_watch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.txt");
        std::fs::write(&path, "hi").unwrap();
        let (backend, registry) = registry();

        let a = registry.acquire(&path, Encoding::Text).unwrap();
        let b = registry.acquire(&path, Encoding::Text).unwrap();
        a.init().await.unwrap();
        assert_eq!(backend.active(), 1);

        a.dispose();
        assert!(!b.is_disposed());
        assert_eq!(backend.active(), 1);
        assert_eq!(registry.ref_count(&path), 1);

        let c = registry.acquire(&path, Encoding::Text).unwrap();
        assert!(c.ptr_eq(&b));
        assert_eq!(registry.ref_count(&path), 2);

        assert!(registry.release(&path));
        assert!(!b.is_disposed());
        assert_eq!(backend.active(), 1);

        b.dispose();
        assert!(b.is_disposed());
        assert_eq!(backend.active(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn disposed_resource_is_recreated_on_next_acquire() {
        let (_, registry) = registry();
        let first = registry.acquire("/tmp/cascade-replaced", Encoding::Text).unwrap();
        first.dispose();
        assert!(first.is_disposed());
        assert_eq!(registry.ref_count("/tmp/cascade-replaced"), 0);

        let second = registry.acquire("/tmp/cascade-replaced", Encoding::Text).unwrap();
        assert!(!second.ptr_eq(&first));
        assert!(!second.is_disposed());
        assert_eq!(registry.ref_count("/tmp/cascade-replaced"), 1);
    }

    #[tokio::test]
    async fn missing_file_fails_init_with_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, registry) = registry();
        let node = registry
            .acquire(dir.path().join("absent.json"), Encoding::Text)
            .unwrap();

        let err = node.init().await.unwrap_err();
        assert!(matches!(err.root_cause(), Error::Read { .. }));
        assert!(!node.is_disposed());
    }
}
