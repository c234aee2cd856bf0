//! Watch Shim
//!
//! One deduplicated change channel per absolute path, layered over an OS
//! notification primitive ([`WatchBackend`]).
//!
//! # Self-write suppression
//!
//! When the process itself writes or touches a watched file through the shim,
//! subscribers are told immediately (a synthetic change) and the entry's
//! `skip_next` flag is set, so the OS's own echo of that write is absorbed.
//! Suppression is single-shot: only the very next OS change is dropped.
//!
//! # Force and wait
//!
//! [`WatchShim::force_and_wait`] resolves only after a *subsequent* call to
//! [`WatchShim::read_through`] on the same path has finished, so the caller
//! knows the graph has seen fresh content, not just that the write landed.

mod backend;
mod stat;

pub use backend::{ManualBackend, PollBackend, WatchBackend, WatchGuard};
pub use stat::FileStat;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::WatchOptions;
use crate::error::{Error, Result};
use crate::graph::Stamp;
use crate::resource::Encoding;
use crate::value::Value;

/// Identifies one listener on one watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A change delivered to watch listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub current: FileStat,
    pub previous: FileStat,
    /// Raised by the shim itself after a write or touch, not by the OS.
    pub synthetic: bool,
}

type ChangeListener = Arc<dyn Fn(&Change) + Send + Sync>;

/// Returned by [`WatchShim::watch`]; identifies the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHandle {
    path: PathBuf,
    id: ListenerId,
}

impl WatchHandle {
    /// The absolute path being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }
}

#[derive(Debug)]
struct EntryState {
    current: FileStat,
    skip_next: bool,
}

/// Shared state for one watched path.
struct WatchEntry {
    path: PathBuf,
    state: Mutex<EntryState>,
    listeners: RwLock<Vec<(ListenerId, ChangeListener)>>,
    guard: Mutex<Option<WatchGuard>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WatchEntry {
    fn add_listener(&self, listener: ChangeListener) -> ListenerId {
        let id = ListenerId::next();
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(entry_id, _)| *entry_id != id);
        listeners.len() != before
    }

    /// Handle a change reported by the OS.
    fn on_os_change(&self, current: FileStat) {
        let previous = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut state.current, current);
            if state.skip_next {
                state.skip_next = false;
                debug!(path = %self.path.display(), "suppressed echo of own write");
                return;
            }
            previous
        };
        self.emit(&Change {
            current,
            previous,
            synthetic: false,
        });
    }

    /// Announce a change the process made itself, absorbing its OS echo.
    fn trigger(&self, current: FileStat) {
        let previous = {
            let mut state = self.state.lock();
            state.skip_next = true;
            std::mem::replace(&mut state.current, current)
        };
        self.emit(&Change {
            current,
            previous,
            synthetic: true,
        });
    }

    fn emit(&self, change: &Change) {
        let snapshot: SmallVec<[ChangeListener; 4]> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        trace!(
            path = %self.path.display(),
            listeners = snapshot.len(),
            synthetic = change.synthetic,
            "change"
        );
        for listener in snapshot {
            listener(change);
        }
    }

    fn shutdown(&self) {
        self.guard.lock().take();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.listeners.write().clear();
    }
}

/// Forward backend notifications into the entry, statting the file each time.
async fn pump(entry: Weak<WatchEntry>, mut changes: mpsc::UnboundedReceiver<()>) {
    while changes.recv().await.is_some() {
        let Some(entry) = entry.upgrade() else {
            return;
        };
        let current = FileStat::read_async(&entry.path).await;
        entry.on_os_change(current);
    }
}

struct PendingRead {
    queued: Stamp,
    done: oneshot::Sender<()>,
}

/// The deduplicating layer between the graph and OS change notification.
///
/// Shared via `Arc`; one shim normally serves a whole graph.
pub struct WatchShim {
    backend: Arc<dyn WatchBackend>,
    entries: DashMap<PathBuf, Arc<WatchEntry>>,
    pending_reads: Mutex<HashMap<PathBuf, Vec<PendingRead>>>,
}

impl WatchShim {
    /// A shim over stat polling.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(PollBackend))
    }

    pub fn with_backend(backend: Arc<dyn WatchBackend>) -> Self {
        Self {
            backend,
            entries: DashMap::new(),
            pending_reads: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe `listener` to changes of `path`.
    ///
    /// The first watch of a path starts the OS watch; later ones share it.
    /// Must be called from within a tokio runtime.
    pub fn watch<F>(
        &self,
        path: impl AsRef<Path>,
        options: WatchOptions,
        listener: F,
    ) -> Result<WatchHandle>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let path = absolute(path.as_ref()).map_err(|err| Error::Watch {
            path: path.as_ref().to_path_buf(),
            message: err.to_string(),
        })?;

        let entry = match self.entries.entry(path.clone()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let entry = self.start_entry(&path, options)?;
                vacant.insert(Arc::clone(&entry));
                entry
            }
        };

        let id = entry.add_listener(Arc::new(listener));
        Ok(WatchHandle { path, id })
    }

    fn start_entry(&self, path: &Path, options: WatchOptions) -> Result<Arc<WatchEntry>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| Error::Watch {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let entry = Arc::new(WatchEntry {
            path: path.to_path_buf(),
            state: Mutex::new(EntryState {
                current: FileStat::read(path),
                skip_next: false,
            }),
            listeners: RwLock::new(Vec::new()),
            guard: Mutex::new(None),
            pump: Mutex::new(None),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.backend.start(path, options, tx)?;
        *entry.guard.lock() = Some(guard);
        *entry.pump.lock() = Some(runtime.spawn(pump(Arc::downgrade(&entry), rx)));

        debug!(path = %path.display(), "watch started");
        Ok(entry)
    }

    /// Remove one listener, or with `None` tear down the whole entry.
    ///
    /// Tearing down stops the OS watch and drops every listener, so it is
    /// meant for the last interested party. Waiters still queued by
    /// [`force_and_wait`](Self::force_and_wait) on the path are released.
    pub fn unwatch(&self, path: impl AsRef<Path>, listener: Option<ListenerId>) -> bool {
        let Ok(path) = absolute(path.as_ref()) else {
            return false;
        };

        match listener {
            Some(id) => self
                .entries
                .get(&path)
                .map(|entry| entry.remove_listener(id))
                .unwrap_or(false),
            None => {
                let Some((_, entry)) = self.entries.remove(&path) else {
                    return false;
                };
                entry.shutdown();
                self.pending_reads.lock().remove(&path);
                debug!(path = %path.display(), "watch stopped");
                true
            }
        }
    }

    pub fn is_watching(&self, path: impl AsRef<Path>) -> bool {
        absolute(path.as_ref())
            .map(|path| self.entries.contains_key(&path))
            .unwrap_or(false)
    }

    pub fn listener_count(&self, path: impl AsRef<Path>) -> usize {
        absolute(path.as_ref())
            .ok()
            .and_then(|path| self.entries.get(&path).map(|entry| entry.listeners.read().len()))
            .unwrap_or(0)
    }

    /// Bump the modification time of `path` (creating it if needed) and tell
    /// its listeners right away.
    pub async fn touch(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = resolve_for_write(path.as_ref())?;
        touch_file(&path).await?;
        self.announce(&path).await;
        Ok(())
    }

    /// Replace the contents of `path` and tell its listeners right away.
    pub async fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = resolve_for_write(path.as_ref())?;
        tokio::fs::write(&path, contents.as_ref())
            .await
            .map_err(|source| Error::Write {
                path: path.clone(),
                source,
            })?;
        self.announce(&path).await;
        Ok(())
    }

    /// Touch `path` and resolve once a later read of it has completed.
    ///
    /// Never resolves if nothing reads the path again; apply a timeout when
    /// that is possible.
    pub async fn force_and_wait(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = resolve_for_write(path.as_ref())?;
        touch_file(&path).await?;
        self.announce_and_wait(&path).await;
        Ok(())
    }

    /// [`write`](Self::write), then wait like [`force_and_wait`](Self::force_and_wait).
    pub async fn write_and_wait(
        &self,
        path: impl AsRef<Path>,
        contents: impl AsRef<[u8]>,
    ) -> Result<()> {
        let path = resolve_for_write(path.as_ref())?;
        tokio::fs::write(&path, contents.as_ref())
            .await
            .map_err(|source| Error::Write {
                path: path.clone(),
                source,
            })?;
        self.announce_and_wait(&path).await;
        Ok(())
    }

    /// Read `path` and release every waiter queued before the read started.
    ///
    /// Waiters are released whether the read succeeded or not.
    pub async fn read_through(&self, path: impl AsRef<Path>, encoding: Encoding) -> Result<Value> {
        let path = absolute(path.as_ref()).map_err(|source| Error::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;

        let started = Stamp::now();
        let read = tokio::fs::read(&path).await;
        self.drain_pending(&path, started);

        let bytes = read.map_err(|source| Error::Read {
            path: path.clone(),
            source,
        })?;
        encoding.interpret(&path, bytes)
    }

    async fn announce(&self, path: &Path) {
        let Some(entry) = self.entry(path) else {
            return;
        };
        let current = FileStat::read_async(path).await;
        entry.trigger(current);
    }

    async fn announce_and_wait(&self, path: &Path) {
        let (done, waiter) = oneshot::channel();
        self.pending_reads
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push(PendingRead {
                queued: Stamp::now(),
                done,
            });

        self.announce(path).await;

        if waiter.await.is_err() {
            debug!(path = %path.display(), "watch stopped before a fresh read");
        }
    }

    fn drain_pending(&self, path: &Path, started: Stamp) {
        let ready = {
            let mut pending = self.pending_reads.lock();
            let Some(waiters) = pending.get_mut(path) else {
                return;
            };
            let (ready, later): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|read| read.queued < started);
            if later.is_empty() {
                pending.remove(path);
            } else {
                *waiters = later;
            }
            ready
        };

        if !ready.is_empty() {
            trace!(path = %path.display(), waiters = ready.len(), "releasing pending reads");
        }
        for read in ready.into_iter().rev() {
            let _ = read.done.send(());
        }
    }

    fn entry(&self, path: &Path) -> Option<Arc<WatchEntry>> {
        self.entries.get(path).map(|entry| Arc::clone(entry.value()))
    }

    #[cfg(test)]
    fn inject_os_change(&self, path: &Path) {
        if let Some(entry) = self.entry(path) {
            entry.on_os_change(FileStat::read(path));
        }
    }
}

impl Default for WatchShim {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WatchShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchShim")
            .field("entries", &self.entries.len())
            .field("pending_reads", &self.pending_reads.lock().len())
            .finish()
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    std::path::absolute(path)
}

fn resolve_for_write(path: &Path) -> Result<PathBuf> {
    absolute(path).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}

async fn touch_file(path: &Path) -> Result<()> {
    let target = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)?;
        file.set_modified(SystemTime::now())
    })
    .await
    .unwrap_or_else(|join| Err(std::io::Error::other(join)));

    result.map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}
