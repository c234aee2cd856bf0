//! Error types for Cascade.
//!
//! Errors travel back to the immediate caller of `init`/`update`/`dirty`.
//! Nothing here is retried automatically and no error marks a node disposed.

use std::path::PathBuf;

use thiserror::Error;

use crate::resource::Encoding;

/// Main error type for graph, watch and resource operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A child or the node's own setup hook failed during `init`.
    #[error("failed to initialize {node}")]
    Init {
        node: String,
        #[source]
        source: Box<Error>,
    },

    /// A node's derive hook failed (e.g. a decode failure).
    #[error("failed to derive {node}: {message}")]
    Derive { node: String, message: String },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS-level watch could not be established.
    #[error("failed to watch {}: {message}", path.display())]
    Watch { path: PathBuf, message: String },

    #[error("resource {} is held as {held:?}, requested as {requested:?}", path.display())]
    EncodingMismatch {
        path: PathBuf,
        held: Encoding,
        requested: Encoding,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a derive failure on the named node.
    pub fn derive(node: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Derive {
            node: node.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn init(node: impl Into<String>, source: Error) -> Self {
        Error::Init {
            node: node.into(),
            source: Box::new(source),
        }
    }

    /// Walk `Init` wrappers down to the error that actually caused the failure.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Init { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias for Cascade operations.
pub type Result<T> = std::result::Result<T, Error>;
