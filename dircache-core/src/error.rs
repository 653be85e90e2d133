// SPDX-License-Identifier: LGPL-3.0-only
//! Error types for the directory cache.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias used across the directory cache crates.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur while listing, sizing or caching directories.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A caller-supplied argument was rejected before any work began.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The path does not exist (or disappeared mid-operation).
    #[error("Path not found: {0:?}")]
    NotFound(PathBuf),

    /// The path exists but is not a directory.
    #[error("Path is not a directory: {0:?}")]
    NotADirectory(PathBuf),

    /// A directory cache already exists for this path.
    #[error("Directory is already watched: {0:?}")]
    AlreadyWatched(PathBuf),

    /// The directory cache is frozen and rejects mutations.
    #[error("Directory cache is frozen: {0:?}")]
    Frozen(PathBuf),

    /// The directory cache was deleted.
    #[error("Directory cache was deleted: {0:?}")]
    Deleted(PathBuf),

    /// A size was written to an entry whose size is already resolved.
    #[error("Size of {0:?} is already resolved")]
    SizeNotPartial(PathBuf),

    /// `remove_at` was called with an index past the end.
    #[error("Index {index} out of bounds for {len} entries")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of entries at the time of the call.
        len: usize,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error from std::fs operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from the file watcher (notify crate).
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// A background job failed to run to completion.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl CacheError {
    /// Wrap an I/O error raised for `path`, keeping not-found conditions distinguishable.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(path.to_path_buf()),
            _ => CacheError::Io(err),
        }
    }

    /// Permission and missing-file conditions are skipped instead of aborting a listing.
    pub fn is_soft(&self) -> bool {
        match self {
            CacheError::NotFound(_) => true,
            CacheError::Io(e) => is_soft_io(e),
            _ => false,
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

/// Permission-denied and not-found I/O errors are recoverable during enumeration.
pub fn is_soft_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
    )
}
