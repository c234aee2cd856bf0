//! Write-through output files.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::derived::ConstNode;
use crate::error::{Error, Result};
use crate::graph::{Compute, Node};
use crate::value::Value;
use crate::watch::WatchShim;

/// Writes its content child to its path child whenever both are settled.
///
/// Writes go through the watch shim, so a graph that also watches the output
/// path sees the write once instead of echoing it. The node's value is the
/// path written.
pub struct FileSink {
    shim: Arc<WatchShim>,
}

impl FileSink {
    /// Write `content` to the path produced by the `path` node.
    pub fn over(shim: Arc<WatchShim>, path: &Node, content: &Node) -> Node {
        let node = Node::new(FileSink { shim });
        node.add_child(path);
        node.add_child(content);
        node
    }

    /// Write `content` to a fixed path.
    pub fn to_path(shim: Arc<WatchShim>, path: impl Into<PathBuf>, content: &Node) -> Node {
        let path = path.into().to_string_lossy().into_owned();
        Self::over(shim, &ConstNode::of(path), content)
    }
}

impl Compute for FileSink {
    fn kind(&self) -> &'static str {
        "FileSink"
    }

    fn derive<'a>(&'a self, inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let [path, content] = inputs else {
                return Err(Error::derive("[FileSink]", "expected path and content children"));
            };
            let Some(path) = path.as_text() else {
                return Err(Error::derive("[FileSink]", "path child is not text"));
            };

            let bytes = content.to_bytes();
            self.shim.write(path, &bytes).await?;
            debug!(path, bytes = bytes.len(), "wrote output");
            Ok(Value::from(path))
        })
    }
}
