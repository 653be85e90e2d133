// SPDX-License-Identifier: LGPL-3.0-only
//! Registry of currently watched directories.

use dircache_core::{CacheError, CacheResult, PathKey};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Set of directories that currently have a live cache.
///
/// Shared by the cache manager and every directory cache it creates, so a
/// second cache for the same path fails at construction.
#[derive(Debug, Default)]
pub struct PathRegistry {
    watched: Mutex<HashSet<PathKey>>,
}

impl PathRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathKey>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `path`, failing if it is already watched.
    pub fn register(&self, path: &Path) -> CacheResult<PathKey> {
        let key = PathKey::new(path);
        if self.lock().insert(key.clone()) {
            Ok(key)
        } else {
            Err(CacheError::AlreadyWatched(path.to_path_buf()))
        }
    }

    /// Release a claim. Returns whether it was held.
    pub fn release(&self, key: &PathKey) -> bool {
        self.lock().remove(key)
    }

    /// Whether `path` is currently watched.
    pub fn is_watched(&self, path: &Path) -> bool {
        self.lock().contains(&PathKey::new(path))
    }

    /// Number of watched directories.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every claim.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
