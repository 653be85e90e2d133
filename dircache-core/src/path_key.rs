// SPDX-License-Identifier: LGPL-3.0-only
//! Case-aware identity keys for paths.

use std::fmt;
use std::path::Path;

/// Whether the host file system compares names case-insensitively.
pub const CASE_INSENSITIVE: bool = cfg!(any(windows, target_os = "macos"));

/// Normalized key used to compare and look up paths.
///
/// On Windows and macOS the key is case folded; elsewhere it is the
/// path as-is. Trailing separators are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(String);

impl PathKey {
    /// Build the key for a path.
    pub fn new(path: &Path) -> Self {
        Self::with_case_folding(path, CASE_INSENSITIVE)
    }

    /// Build a key with explicit case folding.
    pub fn with_case_folding(path: &Path, fold: bool) -> Self {
        let raw = path.to_string_lossy();
        let trimmed = trim_trailing_separators(&raw);
        if fold {
            PathKey(trimmed.to_lowercase())
        } else {
            PathKey(trimmed.to_string())
        }
    }

    /// The normalized key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Path> for PathKey {
    fn from(path: &Path) -> Self {
        PathKey::new(path)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare two paths the way the host file system does.
pub fn same_path(a: &Path, b: &Path) -> bool {
    PathKey::new(a) == PathKey::new(b)
}

fn trim_trailing_separators(raw: &str) -> &str {
    let trimmed = raw.trim_end_matches(std::path::is_separator);
    // Keep the root ("/" or "C:\") intact.
    if trimmed.is_empty() || trimmed.ends_with(':') {
        raw
    } else {
        trimmed
    }
}
