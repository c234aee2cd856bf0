//! JSON push stream of node signals.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::observe;
use crate::graph::{Node, NodeEvent, SubscriberId};
use crate::value::Value;

/// A message on the push stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    Dirty { name: String },
    Update { name: String, data: Value },
}

impl PushMessage {
    fn from_event(name: &str, event: &NodeEvent) -> Option<Self> {
        match event {
            NodeEvent::Dirty => Some(PushMessage::Dirty {
                name: name.to_string(),
            }),
            NodeEvent::Update(data) => Some(PushMessage::Update {
                name: name.to_string(),
                data: data.clone(),
            }),
            NodeEvent::Remove => None,
        }
    }
}

/// Forwards node signals as JSON text to every open connection.
///
/// The transport is up to the caller: each connection is an unbounded
/// channel whose receiving end feeds a websocket, an SSE stream or similar.
/// Connections whose receiver has gone away are pruned on the next send.
#[derive(Clone, Default)]
pub struct PushSink {
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
}

impl PushSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection and return its receiving end.
    pub fn open(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(tx);
        rx
    }

    pub fn attach(&self, connection: mpsc::UnboundedSender<String>) {
        self.connections.lock().push(connection);
    }

    pub fn connection_count(&self) -> usize {
        let mut connections = self.connections.lock();
        connections.retain(|tx| !tx.is_closed());
        connections.len()
    }

    pub fn watch(&self, node: &Node) -> SubscriberId {
        let sink = self.clone();
        observe(node, move |name, event| {
            if let Some(message) = PushMessage::from_event(name, event) {
                sink.send(&message);
            }
        })
    }

    /// Serialize `message` and write it to every open connection.
    pub fn send(&self, message: &PushMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to serialize push message");
                return;
            }
        };

        let mut connections = self.connections.lock();
        connections.retain(|tx| tx.send(text.clone()).is_ok());
        trace!(connections = connections.len(), "pushed");
    }
}

impl fmt::Debug for PushSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSink")
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}
