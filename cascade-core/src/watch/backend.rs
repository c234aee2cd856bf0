//! The OS-level change primitive underneath the watch shim.
//!
//! A backend only has to say "something happened to this path"; the shim
//! stats the file itself and does all deduplication and suppression.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::WatchOptions;
use crate::error::{Error, Result};

/// Keeps an OS-level watch alive. Dropping it stops the watch.
pub struct WatchGuard {
    _inner: Box<dyn Send + Sync>,
}

impl WatchGuard {
    pub fn new<T: Send + Sync + 'static>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

/// Source of OS change notifications for single paths.
pub trait WatchBackend: Send + Sync + 'static {
    /// Begin watching `path`, sending `()` on `changes` for each observed
    /// change, until the returned guard is dropped.
    fn start(
        &self,
        path: &Path,
        options: WatchOptions,
        changes: mpsc::UnboundedSender<()>,
    ) -> Result<WatchGuard>;
}

/// Stat-polling backend built on `notify::PollWatcher`.
///
/// Polling behaves the same on every filesystem (network mounts, containers)
/// and matches the interval semantics of [`WatchOptions`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PollBackend;

impl WatchBackend for PollBackend {
    fn start(
        &self,
        path: &Path,
        options: WatchOptions,
        changes: mpsc::UnboundedSender<()>,
    ) -> Result<WatchGuard> {
        let config = Config::default()
            .with_poll_interval(options.interval)
            .with_compare_contents(options.compare_contents);

        let watched = path.to_path_buf();
        let mut watcher = PollWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_change(&event.kind) => {
                    let _ = changes.send(());
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %watched.display(), error = %err, "poll watcher error");
                }
            },
            config,
        )
        .map_err(|err| watch_error(path, err))?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|err| watch_error(path, err))?;

        debug!(path = %path.display(), interval = ?options.interval, "polling");
        Ok(WatchGuard::new(Mutex::new(watcher)))
    }
}

#[derive(Default)]
struct ManualState {
    senders: HashMap<PathBuf, Vec<mpsc::UnboundedSender<()>>>,
    started: usize,
    stopped: usize,
}

/// A backend that never touches the OS: changes are reported only when
/// [`ManualBackend::notify`] is called.
///
/// Useful for driving the shim deterministically, and for counting how many
/// OS-level watches a graph really opens.
#[derive(Clone, Default)]
pub struct ManualBackend {
    state: Arc<Mutex<ManualState>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report one OS change on `path` to every live watch of it.
    /// Returns how many watches were notified.
    pub fn notify(&self, path: &Path) -> usize {
        let mut state = self.state.lock();
        let Some(senders) = state.senders.get_mut(path) else {
            return 0;
        };
        senders.retain(|tx| tx.send(()).is_ok());
        senders.len()
    }

    pub fn started(&self) -> usize {
        self.state.lock().started
    }

    pub fn stopped(&self) -> usize {
        self.state.lock().stopped
    }

    /// Watches started and not yet stopped.
    pub fn active(&self) -> usize {
        let state = self.state.lock();
        state.started - state.stopped
    }
}

struct ManualGuard {
    path: PathBuf,
    changes: mpsc::UnboundedSender<()>,
    state: Arc<Mutex<ManualState>>,
}

impl Drop for ManualGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.stopped += 1;
        if let Some(senders) = state.senders.get_mut(&self.path) {
            senders.retain(|tx| !tx.same_channel(&self.changes));
            if senders.is_empty() {
                state.senders.remove(&self.path);
            }
        }
    }
}

impl WatchBackend for ManualBackend {
    fn start(
        &self,
        path: &Path,
        _options: WatchOptions,
        changes: mpsc::UnboundedSender<()>,
    ) -> Result<WatchGuard> {
        let mut state = self.state.lock();
        state.started += 1;
        state
            .senders
            .entry(path.to_path_buf())
            .or_default()
            .push(changes.clone());
        Ok(WatchGuard::new(ManualGuard {
            path: path.to_path_buf(),
            changes,
            state: Arc::clone(&self.state),
        }))
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn watch_error(path: &Path, err: notify::Error) -> Error {
    Error::Watch {
        path: PathBuf::from(path),
        message: err.to_string(),
    }
}
