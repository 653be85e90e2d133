// SPDX-License-Identifier: LGPL-3.0-only
//! File system change watcher for a single directory.

use dircache_core::CacheResult;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How long the first half of a rename waits for its second half.
pub const MOVE_GRACE: Duration = Duration::from_millis(100);

/// A raw notification, before rename halves are paired.
#[derive(Debug)]
pub enum WatchEvent {
    /// A new file or directory was created.
    Created(PathBuf),
    /// An existing file or directory was modified.
    Modified(PathBuf),
    /// A file or directory was removed.
    Removed(PathBuf),
    /// A rename reported with both paths at once.
    Renamed {
        /// Old path.
        old: PathBuf,
        /// New path.
        new: PathBuf,
    },
    /// First half of a rename; the second half carries the same cookie.
    MovedFrom {
        /// Old path.
        path: PathBuf,
        /// Rename cookie.
        cookie: usize,
    },
    /// Second half of a rename.
    MovedTo {
        /// New path.
        path: PathBuf,
        /// Rename cookie.
        cookie: usize,
    },
    /// The notification source failed.
    Error(notify::Error),
}

/// A change detected in the watched directory, rename halves paired.
#[derive(Debug)]
pub enum FileSystemChange {
    /// A new file or directory was created.
    Created(PathBuf),
    /// An existing file or directory was modified.
    Modified(PathBuf),
    /// A file or directory was removed.
    Removed(PathBuf),
    /// A file or directory was renamed.
    Renamed {
        /// Old path.
        old: PathBuf,
        /// New path.
        new: PathBuf,
    },
    /// The notification source failed.
    Error(notify::Error),
}

/// Watches one directory (non-recursively) for changes.
///
/// Events are delivered on the channel returned by [`DirectoryWatcher::new`].
/// The platform backend's default mask is used, which is the broadest it
/// offers: names, attributes, sizes, write and creation times, security.
pub struct DirectoryWatcher {
    watcher: RecommendedWatcher,
    path: PathBuf,
    enabled: Arc<AtomicBool>,
    watching: bool,
}

impl DirectoryWatcher {
    /// Start watching `path`.
    pub fn new(path: &Path) -> CacheResult<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let enabled = Arc::new(AtomicBool::new(true));

        let gate = enabled.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if !gate.load(Ordering::Acquire) {
                return;
            }
            match res {
                Ok(event) => {
                    for change in convert_event(event) {
                        let _ = tx.send(change);
                    }
                },
                Err(e) => {
                    let _ = tx.send(WatchEvent::Error(e));
                },
            }
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        Ok((
            Self {
                watcher,
                path: path.to_path_buf(),
                enabled,
                watching: true,
            },
            rx,
        ))
    }

    /// Watched directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop (or resume forwarding) notifications without tearing down the watch.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether notifications are forwarded.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disable and stop watching. The watched path may already be gone.
    pub fn unwatch(&mut self) {
        self.set_enabled(false);
        if self.watching {
            self.watching = false;
            if let Err(e) = self.watcher.unwatch(&self.path) {
                log::debug!("Unwatching {:?} failed: {}", self.path, e);
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.unwatch();
    }
}

/// Convert a notify Event into raw watch events.
fn convert_event(event: Event) -> Vec<WatchEvent> {
    let cookie = event.attrs.tracker();
    let mut paths = event.paths;

    match event.kind {
        EventKind::Create(_) => paths.into_iter().map(WatchEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(WatchEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, cookie) {
            (RenameMode::Both, _) if paths.len() >= 2 => {
                let new = paths.swap_remove(1);
                let old = paths.swap_remove(0);
                vec![WatchEvent::Renamed { old, new }]
            },
            (RenameMode::From, Some(cookie)) => paths
                .into_iter()
                .map(|path| WatchEvent::MovedFrom { path, cookie })
                .collect(),
            (RenameMode::To, Some(cookie)) => paths
                .into_iter()
                .map(|path| WatchEvent::MovedTo { path, cookie })
                .collect(),
            (RenameMode::From, None) => paths.into_iter().map(WatchEvent::Removed).collect(),
            (RenameMode::To, None) => paths.into_iter().map(WatchEvent::Created).collect(),
            // Backends that cannot tell the halves apart: the surviving path is the new name.
            _ => paths
                .into_iter()
                .map(|path| {
                    if path.exists() {
                        WatchEvent::Created(path)
                    } else {
                        WatchEvent::Removed(path)
                    }
                })
                .collect(),
        },
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            paths.into_iter().map(WatchEvent::Modified).collect()
        },
        // Reads do not change anything we cache.
        EventKind::Access(_) => Vec::new(),
    }
}

/// Pairs the two halves of a rename into a single [`FileSystemChange::Renamed`].
///
/// A `MovedFrom` without its `MovedTo` within the grace period became a move
/// out of the directory and is reported as removed; a lone `MovedTo` is a
/// move in and is reported as created.
#[derive(Debug)]
pub struct MoveCoalescer {
    grace: Duration,
    pending: HashMap<usize, (PathBuf, Instant)>,
}

impl MoveCoalescer {
    /// Create a coalescer waiting `grace` for second halves.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: HashMap::new(),
        }
    }

    /// Feed one raw event, returning what can be reported right away.
    pub fn push(&mut self, event: WatchEvent, now: Instant) -> Vec<FileSystemChange> {
        match event {
            WatchEvent::Created(path) => vec![FileSystemChange::Created(path)],
            WatchEvent::Modified(path) => vec![FileSystemChange::Modified(path)],
            WatchEvent::Removed(path) => vec![FileSystemChange::Removed(path)],
            WatchEvent::Error(e) => vec![FileSystemChange::Error(e)],
            WatchEvent::Renamed { old, new } => vec![FileSystemChange::Renamed { old, new }],
            WatchEvent::MovedFrom { path, cookie } => {
                self.pending.insert(cookie, (path, now + self.grace));
                Vec::new()
            },
            WatchEvent::MovedTo { path, cookie } => match self.pending.remove(&cookie) {
                Some((old, _)) => vec![FileSystemChange::Renamed { old, new: path }],
                None => vec![FileSystemChange::Created(path)],
            },
        }
    }

    /// Report first halves whose grace period ended as removals.
    pub fn expire(&mut self, now: Instant) -> Vec<FileSystemChange> {
        let expired: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(cookie, _)| *cookie)
            .collect();
        expired
            .into_iter()
            .filter_map(|cookie| self.pending.remove(&cookie))
            .map(|(path, _)| FileSystemChange::Removed(path))
            .collect()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, deadline)| *deadline).min()
    }
}

impl Default for MoveCoalescer {
    fn default() -> Self {
        Self::new(MOVE_GRACE)
    }
}
