// SPDX-License-Identifier: LGPL-3.0-only
//! Directory caches kept in sync with the file system, and the manager that
//! serves them.

pub mod directory;
pub mod manager;
pub mod registry;
pub mod settings;
pub mod timer;
pub mod watcher;

pub use directory::{
    CacheState, DirectoryCache, DirectoryEvent, PassGuard, Reconciliation, TtlReason,
};
pub use manager::CacheManager;
pub use registry::PathRegistry;
pub use settings::{CacheConfig, SettingsRegistry};
