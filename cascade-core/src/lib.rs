//! Cascade Core
//!
//! An incremental, dependency-tracked computation graph whose leaves are
//! watched files. A change to a file marks everything derived from it dirty
//! and recomputes each affected node exactly once per settled state, even
//! under bursts of rapid changes.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: the node state machine (dirty/update/init/dispose) and the
//!   `Compute` hook each node kind supplies
//! - `watch`: the watch shim, one deduplicated OS watch per path with
//!   suppression of the process's own writes
//! - `resource`: file-backed leaf nodes and the refcounted registry sharing them
//! - `derived`: JSON decoding, marker replacement and constant nodes
//! - `sink`: console, push-stream, pull and write-through observers
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cascade_core::{CascadeConfig, JsonNode, ResourceRegistry, WatchShim};
//!
//! let shim = Arc::new(WatchShim::new());
//! let registry = ResourceRegistry::new(shim.clone(), &CascadeConfig::default());
//!
//! // A parsed view of settings.json that stays current.
//! let settings = JsonNode::file(&registry, "settings.json")?;
//! settings.init().await?;
//!
//! // Rewrite the file and wait until the graph has read it back.
//! shim.write_and_wait("settings.json", r#"{"debug": true}"#).await?;
//! let value = settings.settled().await;
//! ```

pub mod config;
pub mod derived;
pub mod error;
pub mod graph;
pub mod resource;
pub mod sink;
pub mod value;
pub mod watch;

pub use config::{CascadeConfig, WatchOptions};
pub use derived::{ConstNode, JsonNode, Replacer};
pub use error::{Error, Result};
pub use graph::{Compute, Node, NodeEvent};
pub use resource::{Encoding, ResourceRegistry};
pub use value::Value;
pub use watch::WatchShim;
