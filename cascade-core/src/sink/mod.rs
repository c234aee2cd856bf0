//! Observers that render or export node values.
//!
//! Every sink subscribes to a node's `Dirty`/`Update`/`Remove` signals and
//! drops its subscription when it sees `Remove`.

mod console;
mod file;
mod pull;
mod push;

pub use console::{ConsoleSink, LineWriter};
pub use file::FileSink;
pub use pull::PullSink;
pub use push::{PushMessage, PushSink};

use std::sync::{Arc, OnceLock};

use crate::graph::{Node, NodeEvent, SubscriberId};

/// Subscribe `on_event` to `node` until the node is removed.
///
/// The callback receives the node's name along with each signal.
pub(crate) fn observe<F>(node: &Node, on_event: F) -> SubscriberId
where
    F: Fn(&str, &NodeEvent) + Send + Sync + 'static,
{
    let own_id: Arc<OnceLock<SubscriberId>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&own_id);
    let weak = node.downgrade();
    let name = node.name().to_string();

    let id = node.subscribe(move |event| {
        on_event(&name, event);
        if *event == NodeEvent::Remove {
            if let (Some(node), Some(id)) = (weak.upgrade(), slot.get()) {
                node.unsubscribe(*id);
            }
        }
    });
    let _ = own_id.set(id);
    id
}
