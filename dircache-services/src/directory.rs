// SPDX-License-Identifier: LGPL-3.0-only
//! Per-directory entry cache kept in sync with OS change notifications.

use crate::registry::PathRegistry;
use crate::timer::TtlTimer;
use crate::watcher::{DirectoryWatcher, FileSystemChange, MoveCoalescer, WatchEvent};
use dircache_core::path_key::same_path;
use dircache_core::{CacheError, CacheResult, PathKey, SharedEntry};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};

/// Buffer of the per-directory event channel.
const DIRECTORY_EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a [`DirectoryCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Mutations allowed. `partial` is set while the last population pass
    /// has not finished resolving every entry.
    Active {
        /// Whether the entry list is incomplete.
        partial: bool,
    },
    /// TTL elapsed; read-only until the TTL is reassigned.
    Frozen,
    /// Torn down. Terminal.
    Deleted,
}

/// Why a TTL event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlReason {
    /// No activity for a whole interval.
    Elapsed,
    /// The TTL was reassigned, which also unfreezes the cache.
    Updated,
}

/// Events emitted by a directory cache.
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    /// A path appeared; resolving it into an entry is up to the listener.
    Created {
        /// New path.
        path: PathBuf,
    },
    /// An entry was removed from disk and from the cache.
    Deleted {
        /// Removed entry.
        entry: SharedEntry,
    },
    /// An entry was renamed in place.
    Renamed {
        /// Entry, already carrying its new path.
        entry: SharedEntry,
        /// Previous path.
        old_path: PathBuf,
    },
    /// An entry's metadata was re-read.
    Changed {
        /// Refreshed entry.
        entry: SharedEntry,
    },
    /// The TTL elapsed or was reassigned.
    TtlReached {
        /// Which of the two.
        reason: TtlReason,
    },
    /// The watched directory itself was removed.
    PathDeleted,
    /// The notification source failed for another reason.
    WatcherFailed {
        /// Error that occurred.
        error: String,
    },
    /// The cache was deleted; no further events follow.
    Closed,
}

/// Outcome of [`DirectoryCache::reconcile`].
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Entries found on disk that were missing from the cache.
    pub added: Vec<SharedEntry>,
    /// Cached entries no longer on disk.
    pub removed: Vec<SharedEntry>,
    /// Cached entries whose size is still outstanding.
    pub pending: Vec<SharedEntry>,
}

#[derive(Debug)]
struct Inner {
    state: CacheState,
    entries: Vec<SharedEntry>,
    /// Population passes in flight. The TTL cannot elapse while non-zero.
    passes: usize,
}

/// Keeps a [`DirectoryCache`] from expiring while a population pass runs.
///
/// Dropping the guard ends the pass; once no pass is left the TTL timer
/// starts over.
#[derive(Debug)]
#[must_use = "the pass ends when the guard is dropped"]
pub struct PassGuard {
    cache: Arc<DirectoryCache>,
}

impl PassGuard {
    /// Cache the pass runs against.
    pub fn cache(&self) -> &Arc<DirectoryCache> {
        &self.cache
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.cache.end_pass();
    }
}

/// Cache of the immediate entries of one directory.
///
/// Holds the entries, a TTL timer and a notify subscription. The entry list
/// and the state share one lock; notification handling, reconciliation and
/// size commits all go through it.
pub struct DirectoryCache {
    path: PathBuf,
    key: PathKey,
    created_at: SystemTime,
    inner: Mutex<Inner>,
    registry: Arc<PathRegistry>,
    watcher: Mutex<Option<DirectoryWatcher>>,
    timer: TtlTimer,
    events: broadcast::Sender<DirectoryEvent>,
}

impl std::fmt::Debug for DirectoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryCache")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("ttl", &self.ttl())
            .finish()
    }
}

impl DirectoryCache {
    /// Create a cache for `path`, claiming it in `registry`.
    ///
    /// Fails if the path is missing, is not a directory, or already has a
    /// cache. Must be called inside a tokio runtime.
    pub fn new(path: &Path, ttl: Duration, registry: Arc<PathRegistry>) -> CacheResult<Arc<Self>> {
        let metadata = std::fs::metadata(path).map_err(|e| CacheError::from_io(e, path))?;
        if !metadata.is_dir() {
            return Err(CacheError::NotADirectory(path.to_path_buf()));
        }

        let key = registry.register(path)?;
        let (watcher, changes) = match DirectoryWatcher::new(path) {
            Ok(pair) => pair,
            Err(e) => {
                registry.release(&key);
                return Err(e);
            },
        };

        let (events, _) = broadcast::channel(DIRECTORY_EVENT_CAPACITY);
        let cache = Arc::new_cyclic(|weak: &Weak<DirectoryCache>| {
            let expired = weak.clone();
            let timer = TtlTimer::spawn(ttl, move || {
                if let Some(cache) = expired.upgrade() {
                    cache.on_ttl_elapsed();
                }
            });

            DirectoryCache {
                path: path.to_path_buf(),
                key,
                created_at: SystemTime::now(),
                // Nothing is listed yet.
                inner: Mutex::new(Inner {
                    state: CacheState::Active { partial: true },
                    entries: Vec::new(),
                    passes: 0,
                }),
                registry,
                watcher: Mutex::new(Some(watcher)),
                timer,
                events,
            }
        });

        tokio::spawn(pump(Arc::downgrade(&cache), changes));
        log::info!("Watching {:?} (ttl {:?})", path, ttl);
        Ok(cache)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail unless the cache accepts mutations.
    fn writable(&self, inner: &Inner) -> CacheResult<()> {
        match inner.state {
            CacheState::Active { .. } => Ok(()),
            CacheState::Frozen => Err(CacheError::Frozen(self.path.clone())),
            CacheState::Deleted => Err(CacheError::Deleted(self.path.clone())),
        }
    }

    fn emit(&self, event: DirectoryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Watched directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity key of the watched directory.
    pub fn key(&self) -> &PathKey {
        &self.key
    }

    /// When the cache was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Current TTL.
    pub fn ttl(&self) -> Duration {
        self.timer.interval()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CacheState {
        self.lock().state
    }

    /// Whether the TTL elapsed.
    pub fn is_frozen(&self) -> bool {
        self.state() == CacheState::Frozen
    }

    /// Whether the cache was deleted.
    pub fn is_deleted(&self) -> bool {
        self.state() == CacheState::Deleted
    }

    /// Whether the last population pass left work behind.
    pub fn is_partial(&self) -> bool {
        matches!(self.state(), CacheState::Active { partial: true })
    }

    /// Mark the entry list complete or incomplete.
    pub fn set_partial(&self, partial: bool) -> CacheResult<()> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        inner.state = CacheState::Active { partial };
        Ok(())
    }

    /// Snapshot of the cached entries, in insertion order.
    pub fn entries(&self) -> Vec<SharedEntry> {
        self.lock().entries.clone()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Cached entry for `path`.
    pub fn get(&self, path: &Path) -> Option<SharedEntry> {
        let key = PathKey::new(path);
        self.lock().entries.iter().find(|e| e.matches(&key)).cloned()
    }

    /// Whether `path` is cached.
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Whether any cached entry still waits for its size.
    pub fn has_partial_entries(&self) -> bool {
        self.lock().entries.iter().any(|e| e.is_partial())
    }

    /// Cache `entry`. Returns `false` if an entry with the same path is
    /// already cached.
    pub fn add(&self, entry: SharedEntry) -> CacheResult<bool> {
        let idle = {
            let mut inner = self.lock();
            self.writable(&inner)?;
            let key = entry.key();
            if inner.entries.iter().any(|e| e.matches(&key)) {
                return Ok(false);
            }
            inner.entries.push(entry);
            inner.passes == 0
        };
        if idle && !self.timer.is_running() {
            self.timer.restart();
        }
        Ok(true)
    }

    /// Remove `entry`. Returns whether it was cached.
    pub fn remove(&self, entry: &SharedEntry) -> CacheResult<bool> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        let key = entry.key();
        let before = inner.entries.len();
        inner.entries.retain(|e| !e.matches(&key));
        Ok(inner.entries.len() != before)
    }

    /// Remove the entry at `index`.
    pub fn remove_at(&self, index: usize) -> CacheResult<SharedEntry> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        let len = inner.entries.len();
        if index >= len {
            return Err(CacheError::IndexOutOfBounds { index, len });
        }
        Ok(inner.entries.remove(index))
    }

    /// Commit a computed size for `entry` if it is still cached.
    ///
    /// Returns whether the size was stored.
    pub fn complete_size(&self, entry: &SharedEntry, size: u64) -> CacheResult<bool> {
        let inner = self.lock();
        self.writable(&inner)?;
        if !inner.entries.iter().any(|e| Arc::ptr_eq(e, entry)) {
            return Ok(false);
        }
        if !entry.is_partial() {
            return Ok(false);
        }
        entry.set_size(size)?;
        Ok(true)
    }

    /// Bring the entry list in line with a fresh listing of the directory.
    ///
    /// Under a single lock: cached entries missing from `on_disk` are
    /// dropped, listed entries missing from the cache are added, and every
    /// cached entry still partial is returned for recomputation.
    pub fn reconcile(&self, on_disk: Vec<SharedEntry>) -> CacheResult<Reconciliation> {
        let mut inner = self.lock();
        self.writable(&inner)?;

        let disk_keys: HashSet<PathKey> = on_disk.iter().map(|e| e.key()).collect();
        let mut outcome = Reconciliation::default();

        let (kept, removed): (Vec<_>, Vec<_>) = inner
            .entries
            .drain(..)
            .partition(|e| disk_keys.contains(&e.key()));
        inner.entries = kept;
        outcome.removed = removed;

        for fresh in on_disk {
            let key = fresh.key();
            if !inner.entries.iter().any(|e| e.matches(&key)) {
                inner.entries.push(fresh.clone());
                outcome.added.push(fresh);
            }
        }

        outcome.pending = inner
            .entries
            .iter()
            .filter(|e| e.is_partial())
            .cloned()
            .collect();
        Ok(outcome)
    }

    /// Start a population pass. The TTL is suspended until every guard
    /// handed out here is dropped.
    ///
    /// Fails with `Frozen` or `Deleted` if the cache no longer accepts
    /// mutations.
    pub fn begin_pass(self: &Arc<Self>) -> CacheResult<PassGuard> {
        {
            let mut inner = self.lock();
            self.writable(&inner)?;
            inner.passes += 1;
        }
        self.timer.stop();
        Ok(PassGuard {
            cache: self.clone(),
        })
    }

    /// Whether a population pass is in flight.
    pub fn is_busy(&self) -> bool {
        self.lock().passes > 0
    }

    fn end_pass(&self) {
        let idle = {
            let mut inner = self.lock();
            inner.passes = inner.passes.saturating_sub(1);
            inner.passes == 0 && matches!(inner.state, CacheState::Active { .. })
        };
        if idle {
            self.timer.restart();
        }
    }

    /// Set a new TTL, unfreezing the cache and restarting the timer.
    ///
    /// A frozen cache comes back partial: notifications were ignored while
    /// it was frozen, so it needs reconciling before it is trusted again.
    pub fn update_ttl(&self, ttl: Duration) {
        {
            let mut inner = self.lock();
            match inner.state {
                CacheState::Deleted => return,
                CacheState::Frozen => inner.state = CacheState::Active { partial: true },
                CacheState::Active { .. } => {},
            }
        }
        self.timer.set_interval(ttl);
        log::debug!("TTL of {:?} set to {:?}", self.path, ttl);
        self.emit(DirectoryEvent::TtlReached {
            reason: TtlReason::Updated,
        });
    }

    /// Tear the cache down. Safe to call more than once.
    pub fn delete(&self) {
        {
            let mut inner = self.lock();
            if inner.state == CacheState::Deleted {
                return;
            }
            inner.state = CacheState::Deleted;
            inner.entries.clear();
        }

        if let Some(mut watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.unwatch();
        }
        self.timer.shutdown();
        self.registry.release(&self.key);
        log::info!("Stopped watching {:?}", self.path);
        self.emit(DirectoryEvent::Closed);
    }

    /// Subscribe to cache events.
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    fn on_ttl_elapsed(&self) {
        {
            let mut inner = self.lock();
            if inner.state == CacheState::Deleted {
                return;
            }
            if inner.passes > 0 {
                // Re-armed when the last pass ends.
                log::debug!("TTL of {:?} elapsed during a pass, ignoring", self.path);
                return;
            }
            inner.state = CacheState::Frozen;
        }
        log::debug!("TTL of {:?} elapsed, cache frozen", self.path);
        self.emit(DirectoryEvent::TtlReached {
            reason: TtlReason::Elapsed,
        });
    }

    fn is_child(&self, path: &Path) -> bool {
        path.parent().is_some_and(|parent| same_path(parent, &self.path))
    }

    /// Apply one notification. Returns whether it was acted upon.
    fn handle_change(&self, change: FileSystemChange) -> bool {
        match change {
            FileSystemChange::Error(e) => {
                if is_path_gone(&e) || !self.path.exists() {
                    self.emit(DirectoryEvent::PathDeleted);
                } else {
                    log::error!("Watcher for {:?} failed: {}", self.path, e);
                    self.emit(DirectoryEvent::WatcherFailed {
                        error: e.to_string(),
                    });
                }
                false
            },
            FileSystemChange::Removed(path) if same_path(&path, &self.path) => {
                self.emit(DirectoryEvent::PathDeleted);
                false
            },
            FileSystemChange::Created(path) => {
                if !self.is_child(&path) || !self.accepts_notifications() {
                    return false;
                }
                self.emit(DirectoryEvent::Created { path });
                true
            },
            FileSystemChange::Removed(path) => {
                let removed = {
                    let mut inner = self.lock();
                    if self.writable(&inner).is_err() {
                        return false;
                    }
                    let key = PathKey::new(&path);
                    inner
                        .entries
                        .iter()
                        .position(|e| e.matches(&key))
                        .map(|index| inner.entries.remove(index))
                };
                match removed {
                    Some(entry) => {
                        self.emit(DirectoryEvent::Deleted { entry });
                        true
                    },
                    None => false,
                }
            },
            FileSystemChange::Renamed { old, new } => self.handle_rename(old, new),
            FileSystemChange::Modified(path) => {
                if same_path(&path, &self.path) || !self.accepts_notifications() {
                    return false;
                }
                let Some(entry) = self.get(&path) else {
                    return false;
                };
                match entry.refresh() {
                    Ok(()) => {
                        self.emit(DirectoryEvent::Changed { entry });
                        true
                    },
                    Err(e) => {
                        // A removal notification follows.
                        log::debug!("Could not refresh {:?}: {}", path, e);
                        false
                    },
                }
            },
        }
    }

    fn handle_rename(&self, old: PathBuf, new: PathBuf) -> bool {
        let new_inside = self.is_child(&new);
        let old_inside = self.is_child(&old);
        let mut events = Vec::with_capacity(2);
        {
            let mut inner = self.lock();
            if self.writable(&inner).is_err() {
                return false;
            }
            let old_key = PathKey::new(&old);
            let new_key = PathKey::new(&new);
            let moved = inner
                .entries
                .iter()
                .find(|e| e.matches(&old_key))
                .cloned();

            // A rename onto an existing name replaces that file without a
            // separate removal notification. An unknown old name inside the
            // directory is a repeated report of a rename already applied.
            if new_inside && (moved.is_some() || !old_inside) {
                let replaced = inner.entries.iter().position(|e| {
                    e.matches(&new_key) && !moved.as_ref().is_some_and(|m| Arc::ptr_eq(e, m))
                });
                if let Some(index) = replaced {
                    events.push(DirectoryEvent::Deleted {
                        entry: inner.entries.remove(index),
                    });
                }
            }

            match moved {
                Some(entry) if new_inside => {
                    entry.rename(&new);
                    events.push(DirectoryEvent::Renamed { entry, old_path: old });
                },
                Some(entry) => {
                    inner.entries.retain(|e| !Arc::ptr_eq(e, &entry));
                    events.push(DirectoryEvent::Deleted { entry });
                },
                None if new_inside && !inner.entries.iter().any(|e| e.matches(&new_key)) => {
                    events.push(DirectoryEvent::Created { path: new })
                },
                None => {},
            }
        }

        let acted = !events.is_empty();
        for event in events {
            self.emit(event);
        }
        acted
    }

    fn accepts_notifications(&self) -> bool {
        matches!(self.state(), CacheState::Active { .. })
    }
}

impl Drop for DirectoryCache {
    fn drop(&mut self) {
        self.delete();
    }
}

fn is_path_gone(e: &notify::Error) -> bool {
    match &e.kind {
        notify::ErrorKind::PathNotFound => true,
        notify::ErrorKind::Io(io) => io.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

/// Feeds watcher notifications into the cache until the watcher goes away.
async fn pump(cache: Weak<DirectoryCache>, mut changes: mpsc::UnboundedReceiver<WatchEvent>) {
    let mut moves = MoveCoalescer::default();
    loop {
        let deadline = moves.next_deadline();
        let ready = tokio::select! {
            raw = changes.recv() => match raw {
                Some(raw) => moves.push(raw, Instant::now()),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                moves.expire(Instant::now())
            },
        };

        let Some(cache) = cache.upgrade() else {
            break;
        };
        for change in ready {
            log::debug!("{:?}: {:?}", cache.path, change);
            if cache.handle_change(change) {
                // Activity extends the cache's life.
                cache.timer.restart();
            }
        }
    }
    log::debug!("Notification pump exiting");
}
