// SPDX-License-Identifier: LGPL-3.0-only
//! Non-recursive directory enumeration.
//!
//! The blocking functions wrap `std::fs::read_dir`; the `_async` variants run
//! them through `smol::unblock` so they are safe to await inside tokio or any
//! other runtime.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

/// Immediate children of a directory, split by kind.
#[derive(Debug, Default)]
pub struct Listing {
    /// Everything that is not a directory (symlinks included, not followed).
    pub files: Vec<(PathBuf, Metadata)>,
    /// Sub-directories.
    pub directories: Vec<(PathBuf, Metadata)>,
    /// Children that vanished or could not be stat'ed while listing.
    pub skipped: Vec<(PathBuf, io::Error)>,
}

impl Listing {
    /// Total number of listed children.
    pub fn len(&self) -> usize {
        self.files.len() + self.directories.len()
    }

    /// Whether nothing was listed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// List `path` once, stat'ing every child without following symlinks.
pub fn list_directory(path: &Path) -> io::Result<Listing> {
    let mut listing = Listing::default();
    for child in std::fs::read_dir(path)? {
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                listing.skipped.push((path.to_path_buf(), e));
                continue;
            },
        };
        let child_path = child.path();
        match child.metadata() {
            Ok(metadata) if metadata.is_dir() => listing.directories.push((child_path, metadata)),
            Ok(metadata) => listing.files.push((child_path, metadata)),
            Err(e) => listing.skipped.push((child_path, e)),
        }
    }
    Ok(listing)
}

/// Immediate sub-directories of `path`.
pub fn list_subdirectories(path: &Path) -> io::Result<Vec<PathBuf>> {
    list_by_kind(path, true)
}

/// Immediate non-directory children of `path`.
pub fn list_files(path: &Path) -> io::Result<Vec<PathBuf>> {
    list_by_kind(path, false)
}

fn list_by_kind(path: &Path, directories: bool) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for child in std::fs::read_dir(path)? {
        let child = child?;
        // `file_type` does not follow symlinks, so linked directories count as files.
        let is_dir = child.file_type()?.is_dir();
        if is_dir == directories {
            out.push(child.path());
        }
    }
    Ok(out)
}

/// Async [`list_directory`].
pub async fn list_directory_async(path: &Path) -> io::Result<Listing> {
    let path = path.to_path_buf();
    smol::unblock(move || list_directory(&path)).await
}

/// Async `std::fs::metadata`.
pub async fn metadata_async(path: &Path) -> io::Result<Metadata> {
    let path = path.to_path_buf();
    smol::unblock(move || std::fs::metadata(path)).await
}
