// SPDX-License-Identifier: LGPL-3.0-only
//! Recursive, cancellable directory size computation.

use crate::error::{is_soft_io, CacheError, CacheResult};
use crate::events::CacheEvent;
use crate::listing::{list_files, list_subdirectories, metadata_async};
use futures::future::{join_all, BoxFuture, FutureExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

/// Fan-out budget used when none is configured: four jobs per core.
pub fn default_fan_out_budget() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(16)
}

/// Computes the recursive size of directories.
///
/// The async variant runs one tokio task per sub-directory while the
/// shared fan-out budget has permits left. Once the budget is exhausted,
/// the remaining subtrees are summed sequentially on the blocking pool.
/// Clones share the same budget.
///
/// Permission-denied and not-found failures below the requested root are
/// skipped; when an event sender is attached they are reported as
/// [`CacheEvent::Exception`].
#[derive(Clone, Debug)]
pub struct SizeCalculator {
    budget: Arc<Semaphore>,
    events: Option<broadcast::Sender<CacheEvent>>,
}

impl SizeCalculator {
    /// Create a calculator allowing `fan_out_budget` concurrent size jobs.
    pub fn new(fan_out_budget: usize) -> Self {
        Self {
            budget: Arc::new(Semaphore::new(fan_out_budget)),
            events: None,
        }
    }

    /// Report skipped subtrees on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<CacheEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Number of size jobs that could still be spawned right now.
    pub fn available_permits(&self) -> usize {
        self.budget.available_permits()
    }

    /// Size of `path` in bytes, computed on the calling thread.
    ///
    /// For a file this is its length; for a directory the sum of all
    /// descendant file lengths.
    pub fn compute_size_blocking(&self, path: &Path, cancel: &CancellationToken) -> CacheResult<u64> {
        let metadata = std::fs::metadata(path).map_err(|e| CacheError::from_io(e, path))?;
        if !metadata.is_dir() {
            return Ok(metadata.len());
        }
        self.dir_size_blocking(path, cancel)
    }

    /// Size of `path` in bytes, with sub-directories computed concurrently.
    ///
    /// Must be awaited inside a tokio runtime.
    pub async fn compute_size(&self, path: &Path, cancel: &CancellationToken) -> CacheResult<u64> {
        let metadata = metadata_async(path)
            .await
            .map_err(|e| CacheError::from_io(e, path))?;
        if !metadata.is_dir() {
            return Ok(metadata.len());
        }
        self.clone().dir_size(path.to_path_buf(), cancel.clone()).await
    }

    fn dir_size_blocking(&self, path: &Path, cancel: &CancellationToken) -> CacheResult<u64> {
        let mut total = 0;
        if let Some(subdirs) = self.skip_soft(path, list_subdirectories(path))? {
            for sub in subdirs {
                if cancel.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                total += self.dir_size_blocking(&sub, cancel)?;
            }
        }
        total += self.files_size(path, cancel)?;
        Ok(total)
    }

    fn dir_size(self, path: PathBuf, cancel: CancellationToken) -> BoxFuture<'static, CacheResult<u64>> {
        async move {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            // Sub-directories and files are enumerated separately: listing one
            // may be permitted while the other is not.
            let (subdirs, mut total) = {
                let calc = self.clone();
                let path = path.clone();
                let cancel = cancel.clone();
                smol::unblock(move || -> CacheResult<(Vec<PathBuf>, u64)> {
                    let subdirs = calc
                        .skip_soft(&path, list_subdirectories(&path))?
                        .unwrap_or_default();
                    let files = calc.files_size(&path, &cancel)?;
                    Ok((subdirs, files))
                })
                .await?
            };

            let mut jobs = Vec::new();
            for sub in subdirs {
                if cancel.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                let calc = self.clone();
                let cancel = cancel.clone();
                match self.budget.clone().try_acquire_owned() {
                    Ok(permit) => jobs.push(tokio::spawn(async move {
                        let _permit = permit;
                        calc.dir_size(sub, cancel).await
                    })),
                    Err(_) => {
                        total += smol::unblock(move || calc.dir_size_blocking(&sub, &cancel)).await?;
                    },
                }
            }

            for job in join_all(jobs).await {
                total += job.map_err(|e| CacheError::Task(e.to_string()))??;
            }
            Ok(total)
        }
        .boxed()
    }

    fn files_size(&self, path: &Path, cancel: &CancellationToken) -> CacheResult<u64> {
        let Some(files) = self.skip_soft(path, list_files(path))? else {
            return Ok(0);
        };
        let mut total = 0;
        for file in files {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if let Some(metadata) = self.skip_soft(&file, std::fs::symlink_metadata(&file))? {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    fn skip_soft<T>(&self, path: &Path, result: io::Result<T>) -> CacheResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if is_soft_io(&e) => {
                log::warn!("Skipping {:?} while computing size: {}", path, e);
                if let Some(events) = &self.events {
                    let _ = events.send(CacheEvent::Exception {
                        path: path.to_path_buf(),
                        error: e.to_string(),
                    });
                }
                Ok(None)
            },
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}

impl Default for SizeCalculator {
    fn default() -> Self {
        Self::new(default_fan_out_budget())
    }
}
