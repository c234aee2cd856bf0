//! Configuration for the watch layer and resource registry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Interval between stat polls of a watched file, in milliseconds.
    pub poll_interval_ms: u64,

    /// Also hash file contents when polling, so that writes which leave the
    /// mtime untouched are still detected.
    pub compare_contents: bool,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            compare_contents: false,
        }
    }
}

impl CascadeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CascadeConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Options handed to the watch shim for every resource watch.
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            interval: Duration::from_millis(self.poll_interval_ms),
            compare_contents: self.compare_contents,
        }
    }
}

/// Options for establishing a single OS-level watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub interval: Duration,
    pub compare_contents: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        CascadeConfig::default().watch_options()
    }
}
