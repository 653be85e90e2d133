#![warn(missing_docs)]

//! Directory-entry cache for file explorers.
//!
//! Lists directories once, keeps the result alive for a TTL, follows live
//! file system changes and computes recursive directory sizes in the
//! background.

pub use dircache_core as core;
pub use dircache_services as services;

/// A "prelude" for users of the dircache crates.
///
/// Importing this module brings into scope the most common types
/// needed to list and watch directories.
///
/// ```rust
/// use dircache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{
        CacheError, CacheEvent, CacheResult, CancellationToken, ChangeKind, CompletionStatus,
        Entry, EntryAttributes, SharedEntry, SizeCalculator,
    };
    pub use crate::services::{
        CacheConfig, CacheManager, CacheState, DirectoryCache, DirectoryEvent, SettingsRegistry,
    };
}
