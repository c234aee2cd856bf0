//! Console logging of node signals.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use super::observe;
use crate::graph::{Node, NodeEvent, SubscriberId};

/// Destination for console lines when not logging through `tracing`.
pub type LineWriter = Arc<dyn Fn(&str) + Send + Sync>;

/// Logs one line per dirty and update signal:
///
/// ```text
/// <cli ([Json]) dirty>
/// <cli ([Json]) update: 2 keys>
/// ```
#[derive(Clone, Default)]
pub struct ConsoleSink {
    writer: Option<LineWriter>,
}

impl ConsoleSink {
    /// A sink that logs at `info` level under the `cascade::console` target.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_writer<F>(writer: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            writer: Some(Arc::new(writer)),
        }
    }

    pub fn watch(&self, node: &Node) -> SubscriberId {
        let writer = self.writer.clone();
        observe(node, move |name, event| {
            let Some(line) = Self::format(name, event) else {
                return;
            };
            match &writer {
                Some(write) => write(&line),
                None => info!(target: "cascade::console", "{line}"),
            }
        })
    }

    /// The line logged for `event`, if any.
    pub fn format(name: &str, event: &NodeEvent) -> Option<String> {
        match event {
            NodeEvent::Dirty => Some(format!("<cli ({name}) dirty>")),
            NodeEvent::Update(value) => {
                Some(format!("<cli ({name}) update: {}>", value.describe()))
            }
            NodeEvent::Remove => None,
        }
    }
}

impl fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSink")
            .field("custom_writer", &self.writer.is_some())
            .finish()
    }
}
