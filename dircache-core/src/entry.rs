// SPDX-License-Identifier: LGPL-3.0-only
//! Directory entry records.

use crate::error::{CacheError, CacheResult};
use crate::path_key::PathKey;
use bitflags::bitflags;
use std::cmp::Ordering;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

bitflags! {
    /// File-system attributes surfaced for an entry.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EntryAttributes: u16 {
        /// Hidden from default listings (dot-file on Unix).
        const HIDDEN = 1 << 0;
        /// Owned by the operating system.
        const SYSTEM = 1 << 1;
        /// Not writable.
        const READ_ONLY = 1 << 2;
        /// Encrypted at rest by the file system.
        const ENCRYPTED = 1 << 3;
        /// Compressed by the file system.
        const COMPRESSED = 1 << 4;
        /// Block or character device.
        const DEVICE = 1 << 5;
        /// Directory.
        const DIRECTORY = 1 << 6;
    }
}

impl EntryAttributes {
    /// Derive the attribute set from live metadata.
    #[cfg(windows)]
    pub fn from_metadata(_name: &str, metadata: &Metadata) -> Self {
        use std::os::windows::fs::MetadataExt;

        const FILE_ATTRIBUTE_READONLY: u32 = 0x1;
        const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
        const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
        const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;
        const FILE_ATTRIBUTE_DEVICE: u32 = 0x40;
        const FILE_ATTRIBUTE_COMPRESSED: u32 = 0x800;
        const FILE_ATTRIBUTE_ENCRYPTED: u32 = 0x4000;

        let raw = metadata.file_attributes();
        let mut attrs = EntryAttributes::empty();
        for (bit, flag) in [
            (FILE_ATTRIBUTE_READONLY, EntryAttributes::READ_ONLY),
            (FILE_ATTRIBUTE_HIDDEN, EntryAttributes::HIDDEN),
            (FILE_ATTRIBUTE_SYSTEM, EntryAttributes::SYSTEM),
            (FILE_ATTRIBUTE_DIRECTORY, EntryAttributes::DIRECTORY),
            (FILE_ATTRIBUTE_DEVICE, EntryAttributes::DEVICE),
            (FILE_ATTRIBUTE_COMPRESSED, EntryAttributes::COMPRESSED),
            (FILE_ATTRIBUTE_ENCRYPTED, EntryAttributes::ENCRYPTED),
        ] {
            if raw & bit != 0 {
                attrs |= flag;
            }
        }
        attrs
    }

    /// Derive the attribute set from live metadata.
    #[cfg(not(windows))]
    pub fn from_metadata(name: &str, metadata: &Metadata) -> Self {
        let mut attrs = EntryAttributes::empty();
        if name.starts_with('.') {
            attrs |= EntryAttributes::HIDDEN;
        }
        if metadata.permissions().readonly() {
            attrs |= EntryAttributes::READ_ONLY;
        }
        if metadata.is_dir() {
            attrs |= EntryAttributes::DIRECTORY;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            let ft = metadata.file_type();
            if ft.is_block_device() || ft.is_char_device() {
                attrs |= EntryAttributes::DEVICE;
            }
        }
        attrs
    }
}

/// Entries are shared between a directory cache and its consumers.
pub type SharedEntry = Arc<Entry>;

/// Last change observed on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryChange {
    /// The entry was created and nothing happened to it yet.
    Discovered,
    /// A directory size computation finished.
    SizeResolved(u64),
    /// Path and name changed in place.
    Renamed,
    /// Metadata was re-read from disk.
    Refreshed,
}

/// Point-in-time copy of an entry's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// Absolute path.
    pub path: PathBuf,
    /// Display name.
    pub name: String,
    /// Size in bytes (recursive for directories).
    pub size: u64,
    /// Attribute bits.
    pub attributes: EntryAttributes,
    /// Whether the size is still being computed.
    pub partial: bool,
}

#[derive(Debug)]
struct EntryState {
    path: PathBuf,
    key: PathKey,
    name: String,
    size: u64,
    attributes: EntryAttributes,
    partial: bool,
}

/// A cached file or directory.
///
/// Identity is the path (see [`PathKey`]). Everything else, the path
/// included on rename, can change in place; consumers observe those
/// changes through [`Entry::subscribe`].
#[derive(Debug)]
pub struct Entry {
    state: RwLock<EntryState>,
    changes: watch::Sender<EntryChange>,
}

impl Entry {
    /// Build an entry from already-fetched metadata.
    ///
    /// Files take their length; directories start partial with size 0.
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let name = display_name(&path);
        let attributes = EntryAttributes::from_metadata(&name, metadata);
        let is_dir = metadata.is_dir();
        let (changes, _) = watch::channel(EntryChange::Discovered);

        Self {
            state: RwLock::new(EntryState {
                key: PathKey::new(&path),
                path,
                name,
                size: if is_dir { 0 } else { metadata.len() },
                attributes,
                partial: is_dir,
            }),
            changes,
        }
    }

    /// Stat `path` and build an entry for it. Symlinks are not followed.
    pub fn from_path(path: &Path) -> CacheResult<Self> {
        let metadata =
            std::fs::symlink_metadata(path).map_err(|e| CacheError::from_io(e, path))?;
        Ok(Self::from_metadata(path.to_path_buf(), &metadata))
    }

    /// Wrap in an [`Arc`].
    pub fn shared(self) -> SharedEntry {
        Arc::new(self)
    }

    fn read(&self) -> RwLockReadGuard<'_, EntryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Absolute path.
    pub fn path(&self) -> PathBuf {
        self.read().path.clone()
    }

    /// Identity key.
    pub fn key(&self) -> PathKey {
        self.read().key.clone()
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    /// Size in bytes. Meaningless for a directory while [`Entry::is_partial`].
    pub fn size(&self) -> u64 {
        self.read().size
    }

    /// Attribute bits.
    pub fn attributes(&self) -> EntryAttributes {
        self.read().attributes
    }

    /// Check if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.read().attributes.contains(EntryAttributes::DIRECTORY)
    }

    /// Whether the size is still outstanding.
    pub fn is_partial(&self) -> bool {
        self.read().partial
    }

    /// Whether this entry is identified by `path`.
    pub fn matches(&self, key: &PathKey) -> bool {
        &self.read().key == key
    }

    /// Copy all attributes at once.
    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.read();
        EntrySnapshot {
            path: state.path.clone(),
            name: state.name.clone(),
            size: state.size,
            attributes: state.attributes,
            partial: state.partial,
        }
    }

    /// Store a computed size and clear the partial flag.
    ///
    /// Only legal while the entry is partial: a resolved size can only be
    /// replaced through [`Entry::refresh`].
    pub fn set_size(&self, size: u64) -> CacheResult<()> {
        {
            let mut state = self.write();
            if !state.partial {
                return Err(CacheError::SizeNotPartial(state.path.clone()));
            }
            state.size = size;
            state.partial = false;
        }
        self.changes.send_replace(EntryChange::SizeResolved(size));
        Ok(())
    }

    /// Re-read live metadata. File lengths are picked up; directory sizes are
    /// left to the size calculator.
    pub fn refresh(&self) -> CacheResult<()> {
        let path = self.path();
        let metadata =
            std::fs::symlink_metadata(&path).map_err(|e| CacheError::from_io(e, &path))?;
        {
            let mut state = self.write();
            let attributes = EntryAttributes::from_metadata(&state.name, &metadata);
            state.attributes = attributes;
            if !metadata.is_dir() {
                state.size = metadata.len();
                state.partial = false;
            }
        }
        self.changes.send_replace(EntryChange::Refreshed);
        Ok(())
    }

    /// Move the entry to `new_path` in place.
    pub fn rename(&self, new_path: &Path) {
        {
            let mut state = self.write();
            state.path = new_path.to_path_buf();
            state.key = PathKey::new(new_path);
            state.name = display_name(new_path);
            // The hidden bit follows the name on Unix.
            #[cfg(not(windows))]
            {
                let hidden = state.name.starts_with('.');
                state.attributes.set(EntryAttributes::HIDDEN, hidden);
            }
        }
        self.changes.send_replace(EntryChange::Renamed);
    }

    /// Observe changes to this entry.
    pub fn subscribe(&self) -> watch::Receiver<EntryChange> {
        self.changes.subscribe()
    }

    /// Display order: directories first, then larger sizes first.
    pub fn display_cmp(&self, other: &Entry) -> Ordering {
        if std::ptr::eq(self, other) {
            return Ordering::Equal;
        }
        let (a_dir, a_size) = {
            let s = self.read();
            (s.attributes.contains(EntryAttributes::DIRECTORY), s.size)
        };
        let (b_dir, b_size) = {
            let s = other.read();
            (s.attributes.contains(EntryAttributes::DIRECTORY), s.size)
        };
        b_dir.cmp(&a_dir).then(b_size.cmp(&a_size))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || self.key() == other.key()
    }
}

impl Eq for Entry {}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
