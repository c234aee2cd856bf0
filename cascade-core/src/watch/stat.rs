//! Resource signatures compared across polls.

use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;

/// What the watcher knows about a file at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub exists: bool,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileStat {
    /// The signature of a path with nothing behind it.
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            exists: true,
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }

    /// Stat `path`, treating any failure as a missing file.
    pub fn read(path: &Path) -> Self {
        std::fs::metadata(path)
            .map(|m| Self::from_metadata(&m))
            .unwrap_or_else(|_| Self::missing())
    }

    pub async fn read_async(path: &Path) -> Self {
        tokio::fs::metadata(path)
            .await
            .map(|m| Self::from_metadata(&m))
            .unwrap_or_else(|_| Self::missing())
    }
}
