// SPDX-License-Identifier: LGPL-3.0-only
//! Core types for the directory-entry cache: entries, events, errors and
//! the recursive size calculator.

pub mod entry;
pub mod error;
pub mod events;
pub mod listing;
pub mod path_key;
pub mod size;

// Re-export public API
pub use entry::{Entry, EntryAttributes, EntryChange, EntrySnapshot, SharedEntry};
pub use error::{CacheError, CacheResult};
pub use events::{CacheEvent, ChangeKind, CompletionStatus};
pub use path_key::PathKey;
pub use size::SizeCalculator;
pub use tokio_util::sync::CancellationToken;
