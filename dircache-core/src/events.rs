// SPDX-License-Identifier: LGPL-3.0-only
//! Application-level events published by the cache manager.

use crate::entry::SharedEntry;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Default buffer of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new file or directory appeared.
    Created,
    /// The entry was removed from disk and from its cache.
    Deleted,
    /// The entry was renamed in place.
    Renamed,
    /// The entry's metadata changed.
    Changed,
}

/// How a listing request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Every entry was streamed and every size resolved.
    Completed,
    /// The request was cancelled; the cache is left partial.
    Cancelled,
}

/// Events emitted by the cache for UI updates.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// An entry was created, deleted, renamed or changed on disk.
    Change {
        /// The affected entry.
        entry: SharedEntry,
        /// Kind of change.
        kind: ChangeKind,
    },
    /// A directory is being visited.
    Progress {
        /// Path being visited.
        path: PathBuf,
    },
    /// A recoverable failure was skipped.
    Exception {
        /// Path the failure relates to.
        path: PathBuf,
        /// Error that occurred.
        error: String,
    },
    /// A listing request finished.
    Completed {
        /// Requested directory.
        path: PathBuf,
        /// How it ended.
        status: CompletionStatus,
    },
}

/// Create a new broadcast channel for cache events.
pub fn create_event_channel(capacity: usize) -> broadcast::Sender<CacheEvent> {
    broadcast::channel(capacity.max(1)).0
}
