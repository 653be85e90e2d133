// SPDX-License-Identifier: LGPL-3.0-only
//! Keyed registry of directory caches and the "get entries" pipeline.

use crate::directory::{DirectoryCache, DirectoryEvent, PassGuard};
use crate::registry::PathRegistry;
use crate::settings::CacheConfig;
use dircache_core::events::create_event_channel;
use dircache_core::listing::{list_directory_async, metadata_async, Listing};
use dircache_core::path_key::CASE_INSENSITIVE;
use dircache_core::{
    CacheError, CacheEvent, CacheResult, CancellationToken, ChangeKind, CompletionStatus, Entry,
    PathKey, SharedEntry, SizeCalculator,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

struct ManagerInner {
    caches: Mutex<HashMap<PathKey, Arc<DirectoryCache>>>,
    registry: Arc<PathRegistry>,
    ttl: Mutex<Duration>,
    events: broadcast::Sender<CacheEvent>,
    sizes: SizeCalculator,
}

/// Entry point of the directory cache.
///
/// Owns one [`DirectoryCache`] per directory it was asked about, streams
/// entries to callers, resolves directory sizes in the background and
/// re-publishes file system changes as [`CacheEvent`]s. Clones share the
/// same caches.
///
/// All async methods must be awaited inside a tokio runtime.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("caches", &self.cached_paths())
            .field("ttl", &self.ttl())
            .finish()
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheManager {
    /// Create a manager with no cached directories.
    pub fn new(config: CacheConfig) -> Self {
        let events = create_event_channel(config.event_capacity);
        let sizes = SizeCalculator::new(config.fan_out_budget).with_events(events.clone());
        Self {
            inner: Arc::new(ManagerInner {
                caches: Mutex::new(HashMap::new()),
                registry: Arc::new(PathRegistry::new()),
                ttl: Mutex::new(config.ttl),
                events,
                sizes,
            }),
        }
    }

    /// Stream the entries of `path` into `collection`.
    ///
    /// Every entry is handed to `append` as soon as it is known. Files come
    /// first with their final size; sub-directories follow as partial
    /// entries whose sizes resolve in the background before this returns.
    /// Returns the number of entries streamed.
    ///
    /// On cancellation the cache is kept, marked partial, and the next call
    /// for the same path picks up where this one stopped.
    pub async fn get_entries<C, F>(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
        collection: &C,
        append: F,
    ) -> CacheResult<usize>
    where
        C: ?Sized + Sync,
        F: Fn(&C, SharedEntry) + Sync,
    {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(CacheError::InvalidArgument("path is empty".to_string()));
        }
        let path = canonicalize_async(path).await?;
        let metadata = metadata_async(&path)
            .await
            .map_err(|e| CacheError::from_io(e, &path))?;
        if !metadata.is_dir() {
            return Err(CacheError::NotADirectory(path));
        }

        self.inner.publish(CacheEvent::Progress { path: path.clone() });
        let result = if cancel.is_cancelled() {
            Err(CacheError::Cancelled)
        } else {
            self.fill(&path, cancel, collection, &append).await
        };

        match &result {
            Ok(count) => {
                log::debug!("Listed {} entries of {:?}", count, path);
                self.inner.publish(CacheEvent::Completed {
                    path,
                    status: CompletionStatus::Completed,
                });
            },
            Err(CacheError::Cancelled) => {
                log::debug!("Listing of {:?} cancelled", path);
                self.inner.publish(CacheEvent::Completed {
                    path,
                    status: CompletionStatus::Cancelled,
                });
            },
            Err(e) => log::warn!("Listing of {:?} failed: {}", path, e),
        }
        result
    }

    async fn fill<C, F>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        collection: &C,
        append: &F,
    ) -> CacheResult<usize>
    where
        C: ?Sized + Sync,
        F: Fn(&C, SharedEntry) + Sync,
    {
        let (pass, created) = self.open_cache(path)?;
        let cache = pass.cache();

        let result = if created {
            self.populate(cache, cancel, collection, append).await
        } else {
            self.replay(cache, cancel, collection, append).await
        };
        let result = match result {
            Ok(count) => cache.set_partial(cache.has_partial_entries()).map(|()| count),
            Err(e) => Err(e),
        };

        match result {
            Err(CacheError::Frozen(_) | CacheError::Deleted(_)) => {
                // Reset or removed mid-listing; a retry starts over.
                log::debug!("Cache for {:?} closed during the listing", path);
                Err(CacheError::Cancelled)
            },
            Err(CacheError::Cancelled) => {
                // Whatever was resolved stays; the rest is redone next time.
                let _ = cache.set_partial(true);
                Err(CacheError::Cancelled)
            },
            Err(e @ (CacheError::NotFound(_) | CacheError::NotADirectory(_))) => {
                self.inner.discard(cache);
                Err(e)
            },
            Err(e) => {
                let _ = cache.set_partial(true);
                Err(e)
            },
            Ok(count) => Ok(count),
        }
    }

    /// Find the live cache for `path` or create one, and start a pass on it
    /// so it cannot expire mid-listing. The flag tells whether it was just
    /// created.
    fn open_cache(&self, path: &Path) -> CacheResult<(PassGuard, bool)> {
        let key = PathKey::new(path);
        let pass = {
            let mut caches = self.inner.lock_caches();
            if let Some(existing) = caches.get(&key) {
                if let Ok(pass) = existing.begin_pass() {
                    return Ok((pass, false));
                }
                log::debug!("Rebuilding expired cache for {:?}", path);
                if let Some(stale) = caches.remove(&key) {
                    stale.delete();
                }
            }
            let cache = DirectoryCache::new(path, self.ttl(), self.inner.registry.clone())?;
            caches.insert(key, cache.clone());
            cache.begin_pass().map_err(|e| {
                log::debug!("New cache for {:?} expired before its first pass: {}", path, e);
                CacheError::Cancelled
            })?
        };
        self.spawn_listener(pass.cache());
        Ok((pass, true))
    }

    /// Fill a fresh cache from disk.
    async fn populate<C, F>(
        &self,
        cache: &Arc<DirectoryCache>,
        cancel: &CancellationToken,
        collection: &C,
        append: &F,
    ) -> CacheResult<usize>
    where
        C: ?Sized + Sync,
        F: Fn(&C, SharedEntry) + Sync,
    {
        let listing = self.list(cache.path()).await?;
        let mut count = 0;

        for (file_path, metadata) in listing.files {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let entry = cache_entry(cache, Entry::from_metadata(file_path, &metadata).shared())?;
            append(collection, entry);
            count += 1;
        }

        let mut jobs = Vec::new();
        for (dir_path, metadata) in listing.directories {
            if cancel.is_cancelled() {
                break;
            }
            let entry = cache_entry(cache, Entry::from_metadata(dir_path, &metadata).shared())?;
            append(collection, entry.clone());
            count += 1;
            if entry.is_partial() {
                jobs.push(self.spawn_size_job(cache.clone(), entry, cancel.clone()));
            }
        }

        join_size_jobs(jobs).await?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Ok(count)
    }

    /// Serve a live cache, reconciling it first if it is incomplete.
    async fn replay<C, F>(
        &self,
        cache: &Arc<DirectoryCache>,
        cancel: &CancellationToken,
        collection: &C,
        append: &F,
    ) -> CacheResult<usize>
    where
        C: ?Sized + Sync,
        F: Fn(&C, SharedEntry) + Sync,
    {
        let entries = cache.entries();
        let mut count = entries.len();
        for entry in entries {
            append(collection, entry);
        }

        if cache.is_partial() || cache.has_partial_entries() {
            log::debug!("Reconciling partial cache for {:?}", cache.path());
            count += self.reconcile(cache, cancel, collection, append).await?;
        }
        Ok(count)
    }

    /// Diff a partial cache against disk and finish outstanding sizes.
    /// Returns the number of newly streamed entries.
    async fn reconcile<C, F>(
        &self,
        cache: &Arc<DirectoryCache>,
        cancel: &CancellationToken,
        collection: &C,
        append: &F,
    ) -> CacheResult<usize>
    where
        C: ?Sized + Sync,
        F: Fn(&C, SharedEntry) + Sync,
    {
        let listing = self.list(cache.path()).await?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let on_disk = listing
            .files
            .into_iter()
            .chain(listing.directories)
            .map(|(path, metadata)| Entry::from_metadata(path, &metadata).shared())
            .collect();
        let outcome = cache.reconcile(on_disk)?;

        for entry in outcome.removed {
            self.inner.publish(CacheEvent::Change {
                entry,
                kind: ChangeKind::Deleted,
            });
        }
        let added = outcome.added.len();
        for entry in outcome.added {
            append(collection, entry);
        }

        let jobs = outcome
            .pending
            .into_iter()
            .map(|entry| self.spawn_size_job(cache.clone(), entry, cancel.clone()))
            .collect();
        join_size_jobs(jobs).await?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Ok(added)
    }

    async fn list(&self, path: &Path) -> CacheResult<Listing> {
        let listing = list_directory_async(path)
            .await
            .map_err(|e| CacheError::from_io(e, path))?;
        for (skipped, error) in &listing.skipped {
            log::warn!("Skipping {:?}: {}", skipped, error);
            self.inner.publish(CacheEvent::Exception {
                path: skipped.clone(),
                error: error.to_string(),
            });
        }
        Ok(listing)
    }

    fn spawn_size_job(
        &self,
        cache: Arc<DirectoryCache>,
        entry: SharedEntry,
        cancel: CancellationToken,
    ) -> JoinHandle<CacheResult<()>> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let path = entry.path();
            inner.publish(CacheEvent::Progress { path: path.clone() });
            match inner.sizes.compute_size(&path, &cancel).await {
                Ok(size) => match cache.complete_size(&entry, size) {
                    Ok(_) => Ok(()),
                    Err(e @ (CacheError::Frozen(_) | CacheError::Deleted(_))) => Err(e),
                    Err(e) => {
                        log::debug!("Dropping size of {:?}: {}", path, e);
                        Ok(())
                    },
                },
                Err(e) if e.is_soft() => {
                    // Usually a removal notification is on its way.
                    log::warn!("Could not size {:?}: {}", path, e);
                    inner.publish(CacheEvent::Exception {
                        path,
                        error: e.to_string(),
                    });
                    Ok(())
                },
                Err(e) => Err(e),
            }
        })
    }

    fn spawn_listener(&self, cache: &Arc<DirectoryCache>) {
        let mut rx = cache.subscribe();
        let weak_cache = Arc::downgrade(cache);
        let weak_inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Missed {} directory events, marking cache partial", missed);
                        if let Some(cache) = weak_cache.upgrade() {
                            let _ = cache.set_partial(true);
                        }
                        continue;
                    },
                    Err(RecvError::Closed) => break,
                };
                if !ManagerInner::on_directory_event(&weak_inner, &weak_cache, event).await {
                    break;
                }
            }
        });
    }

    /// Resolve the on-disk casing of every component of `path`.
    ///
    /// Only reads the file system. Fails with `NotFound` if a component does
    /// not exist.
    pub async fn get_real_path(&self, path: impl AsRef<Path>) -> CacheResult<PathBuf> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(CacheError::InvalidArgument("path is empty".to_string()));
        }
        smol::unblock(move || real_path_blocking(&path)).await
    }

    /// Recursive size of `path`, sharing the manager's fan-out budget.
    pub async fn compute_size(&self, path: impl AsRef<Path>, cancel: &CancellationToken) -> CacheResult<u64> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(CacheError::InvalidArgument("path is empty".to_string()));
        }
        self.inner.sizes.compute_size(path, cancel).await
    }

    /// Destroy every cache.
    pub fn reset(&self) {
        // Map and registry change under one lock.
        let mut caches = self.inner.lock_caches();
        log::info!("Resetting {} directory caches", caches.len());
        for (_, cache) in caches.drain() {
            cache.delete();
        }
        self.inner.registry.clear();
    }

    /// TTL applied to new caches.
    pub fn ttl(&self) -> Duration {
        *self.inner.ttl.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the TTL of new and live caches. Frozen caches come back to
    /// life partial.
    pub fn set_ttl(&self, ttl: Duration) {
        *self.inner.ttl.lock().unwrap_or_else(PoisonError::into_inner) = ttl;
        for cache in self.inner.snapshot() {
            cache.update_ttl(ttl);
        }
    }

    /// Subscribe to application events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Directories that currently have a cache.
    pub fn cached_paths(&self) -> Vec<PathBuf> {
        self.inner
            .snapshot()
            .iter()
            .map(|cache| cache.path().to_path_buf())
            .collect()
    }

    /// Whether `path` currently has a cache.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.cache_for(path).is_some()
    }

    /// The cache of `path`, if any.
    pub fn cache_for(&self, path: impl AsRef<Path>) -> Option<Arc<DirectoryCache>> {
        let path = path.as_ref();
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.inner.lock_caches().get(&PathKey::new(&path)).cloned()
    }

    /// Registry of watched directories.
    pub fn registry(&self) -> Arc<PathRegistry> {
        self.inner.registry.clone()
    }
}

impl ManagerInner {
    fn lock_caches(&self) -> MutexGuard<'_, HashMap<PathKey, Arc<DirectoryCache>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<DirectoryCache>> {
        self.lock_caches().values().cloned().collect()
    }

    fn publish(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    /// Drop `cache` from the map (if it is still the one mapped) and delete it.
    fn discard(&self, cache: &Arc<DirectoryCache>) {
        let mut caches = self.lock_caches();
        if caches
            .get(cache.key())
            .is_some_and(|mapped| Arc::ptr_eq(mapped, cache))
        {
            caches.remove(cache.key());
        }
        cache.delete();
    }

    /// Handle one directory event. Returns `false` once the listener is done.
    async fn on_directory_event(
        inner: &Weak<ManagerInner>,
        cache: &Weak<DirectoryCache>,
        event: DirectoryEvent,
    ) -> bool {
        let (Some(inner), Some(cache)) = (inner.upgrade(), cache.upgrade()) else {
            return false;
        };

        match event {
            DirectoryEvent::Created { path } => {
                inner.on_created(&cache, path).await;
            },
            DirectoryEvent::Deleted { entry } => inner.publish(CacheEvent::Change {
                entry,
                kind: ChangeKind::Deleted,
            }),
            DirectoryEvent::Renamed { entry, old_path } => {
                log::debug!("{:?} renamed to {:?}", old_path, entry.path());
                inner.publish(CacheEvent::Change {
                    entry,
                    kind: ChangeKind::Renamed,
                });
            },
            DirectoryEvent::Changed { entry } => inner.publish(CacheEvent::Change {
                entry,
                kind: ChangeKind::Changed,
            }),
            DirectoryEvent::TtlReached { reason } => {
                log::debug!("TTL of {:?} reached: {:?}", cache.path(), reason);
            },
            DirectoryEvent::PathDeleted => {
                log::info!("{:?} was removed, dropping its cache", cache.path());
                inner.discard(&cache);
                return false;
            },
            DirectoryEvent::WatcherFailed { error } => {
                inner.publish(CacheEvent::Exception {
                    path: cache.path().to_path_buf(),
                    error,
                });
                inner.discard(&cache);
                return false;
            },
            DirectoryEvent::Closed => return false,
        }
        true
    }

    async fn on_created(&self, cache: &Arc<DirectoryCache>, path: PathBuf) {
        let stat_path = path.clone();
        let entry = match smol::unblock(move || Entry::from_path(&stat_path)).await {
            Ok(entry) => entry.shared(),
            Err(e) => {
                // Gone again before we got to it.
                log::debug!("Ignoring created {:?}: {}", path, e);
                return;
            },
        };

        if entry.is_dir() {
            match self.sizes.compute_size(&path, &CancellationToken::new()).await {
                Ok(size) => {
                    let _ = entry.set_size(size);
                },
                Err(e) => log::warn!("Could not size {:?}: {}", path, e),
            }
        }

        match cache.add(entry.clone()) {
            Ok(true) => self.publish(CacheEvent::Change {
                entry,
                kind: ChangeKind::Created,
            }),
            Ok(false) => {},
            Err(e) => log::debug!("Not caching {:?}: {}", path, e),
        }
    }
}

/// Add `entry` to `cache`, returning the instance the cache ends up holding.
fn cache_entry(cache: &DirectoryCache, entry: SharedEntry) -> CacheResult<SharedEntry> {
    if cache.add(entry.clone())? {
        return Ok(entry);
    }
    Ok(cache.get(&entry.path()).unwrap_or(entry))
}

async fn join_size_jobs(jobs: Vec<JoinHandle<CacheResult<()>>>) -> CacheResult<()> {
    let mut failure = None;
    for job in join_all(jobs).await {
        let result = job.map_err(|e| CacheError::Task(e.to_string())).and_then(|r| r);
        match result {
            Ok(()) => {},
            // Cancellation wins over any other failure.
            Err(CacheError::Cancelled) => failure = Some(CacheError::Cancelled),
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            },
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn canonicalize_async(path: &Path) -> CacheResult<PathBuf> {
    let owned = path.to_path_buf();
    smol::unblock(move || std::fs::canonicalize(owned))
        .await
        .map_err(|e| CacheError::from_io(e, path))
}

fn real_path_blocking(path: &Path) -> CacheResult<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        let Component::Normal(name) = component else {
            resolved.push(component.as_os_str());
            continue;
        };

        let parent = if resolved.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            resolved.clone()
        };
        let wanted = name.to_string_lossy();
        let mut folded = None;
        let mut exact = false;
        for child in std::fs::read_dir(&parent).map_err(|e| CacheError::from_io(e, &parent))? {
            let child = child?;
            let child_name = child.file_name();
            if child_name.as_os_str() == name {
                exact = true;
                break;
            }
            if CASE_INSENSITIVE
                && folded.is_none()
                && child_name.to_string_lossy().to_lowercase() == wanted.to_lowercase()
            {
                folded = Some(child_name);
            }
        }

        match (exact, folded) {
            (true, _) => resolved.push(name),
            (false, Some(on_disk)) => resolved.push(on_disk),
            (false, None) => return Err(CacheError::NotFound(parent.join(name))),
        }
    }
    Ok(resolved)
}
