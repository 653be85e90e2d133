//! Tests for the cache manager's listing pipeline and change tracking

use dircache_core::{
    CacheError, CacheEvent, CancellationToken, ChangeKind, CompletionStatus, SharedEntry,
};
use dircache_services::{CacheConfig, CacheManager, CacheState};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

/// What the caller saw at the moment an entry was streamed.
#[derive(Debug, Clone)]
struct Seen {
    entry: SharedEntry,
    name: String,
    size: u64,
    partial: bool,
}

#[derive(Default)]
struct Sink {
    seen: Mutex<Vec<Seen>>,
}

impl Sink {
    fn push(&self, entry: SharedEntry) {
        let seen = Seen {
            name: entry.name(),
            size: entry.size(),
            partial: entry.is_partial(),
            entry,
        };
        self.seen.lock().unwrap().push(seen);
    }

    fn take(&self) -> Vec<Seen> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

fn manager(ttl: Duration) -> CacheManager {
    CacheManager::new(CacheConfig {
        ttl,
        fan_out_budget: 8,
        event_capacity: 256,
    })
}

/// D/a.txt (100 bytes) and D/E/b.txt (50 bytes).
fn scenario_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), vec![0u8; 100]).unwrap();
    fs::create_dir(dir.path().join("E")).unwrap();
    fs::write(dir.path().join("E/b.txt"), vec![0u8; 50]).unwrap();
    dir
}

async fn wait_for<F>(events: &mut broadcast::Receiver<CacheEvent>, mut pred: F) -> CacheEvent
where
    F: FnMut(&CacheEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_files_then_directories_with_resolved_sizes() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();

    let count = manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let seen = sink.take();
    assert_eq!(seen[0].name, "a.txt");
    assert_eq!(seen[0].size, 100);
    assert!(!seen[0].partial);
    assert_eq!(seen[1].name, "E");
    assert!(seen[1].partial, "directories are streamed before their size is known");

    // Resolved by the time get_entries returns.
    assert_eq!(seen[1].entry.size(), 50);
    assert!(!seen[1].entry.is_partial());

    let cache = manager.cache_for(dir.path()).unwrap();
    assert_eq!(cache.state(), CacheState::Active { partial: false });

    let done = wait_for(&mut events, |e| matches!(e, CacheEvent::Completed { .. })).await;
    assert!(matches!(
        done,
        CacheEvent::Completed {
            status: CompletionStatus::Completed,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_then_retry_completes_from_cache() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();
    let token = CancellationToken::new();

    // Cancel as soon as the first entry arrives.
    let result = manager
        .get_entries(dir.path(), &token, &sink, |sink: &Sink, entry| {
            sink.push(entry);
            token.cancel();
        })
        .await;
    assert!(matches!(result, Err(CacheError::Cancelled)));
    let first = sink.take();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name, "a.txt");

    wait_for(&mut events, |e| {
        matches!(
            e,
            CacheEvent::Completed {
                status: CompletionStatus::Cancelled,
                ..
            }
        )
    })
    .await;
    let cache = manager.cache_for(dir.path()).unwrap();
    assert!(cache.is_partial());

    let count = manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let second = sink.take();
    assert!(Arc::ptr_eq(&second[0].entry, &first[0].entry), "a.txt served from cache");
    let e = second.iter().find(|s| s.name == "E").unwrap();
    assert_eq!(e.entry.size(), 50);
    assert!(!e.entry.is_partial());
    assert!(!cache.is_partial());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_cancellation_never_leaves_wrong_sizes() {
    let dir = scenario_tree();
    for i in 0..4 {
        fs::create_dir(dir.path().join(format!("sub{}", i))).unwrap();
        fs::write(dir.path().join(format!("sub{}/f", i)), vec![0u8; 10 * (i + 1)]).unwrap();
    }
    let manager = manager(Duration::from_secs(60));
    let sink = Sink::default();
    let exact = dircache_core::SizeCalculator::new(1);

    for round in 1..=3 {
        let token = CancellationToken::new();
        let streamed = AtomicUsize::new(0);
        let _ = manager
            .get_entries(dir.path(), &token, &sink, |sink: &Sink, entry| {
                sink.push(entry);
                if streamed.fetch_add(1, Ordering::SeqCst) + 1 >= round {
                    token.cancel();
                }
            })
            .await;

        for entry in manager.cache_for(dir.path()).unwrap().entries() {
            if entry.is_dir() && !entry.is_partial() {
                let expected = exact
                    .compute_size_blocking(&entry.path(), &CancellationToken::new())
                    .unwrap();
                assert_eq!(entry.size(), expected);
            }
        }
        sink.take();
    }

    manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    let seen = sink.take();
    assert_eq!(seen.len(), 6);
    for i in 0..4 {
        let name = format!("sub{}", i);
        let entry = &seen.iter().find(|s| s.name == name).unwrap().entry;
        assert_eq!(entry.size(), 10 * (i as u64 + 1));
    }
    assert!(!manager.cache_for(dir.path()).unwrap().is_partial());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_hit_replays_same_entries() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let sink = Sink::default();
    let token = CancellationToken::new();

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    let first = sink.take();
    let cache = manager.cache_for(dir.path()).unwrap();

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    let second = sink.take();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert!(Arc::ptr_eq(&a.entry, &b.entry));
    }
    assert!(Arc::ptr_eq(&cache, &manager.cache_for(dir.path()).unwrap()));
    assert_eq!(manager.registry().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_external_delete_is_published() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();
    let token = CancellationToken::new();

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    sink.take();

    fs::remove_file(dir.path().join("a.txt")).unwrap();
    let event = wait_for(&mut events, |e| {
        matches!(e, CacheEvent::Change { kind: ChangeKind::Deleted, .. })
    })
    .await;
    if let CacheEvent::Change { entry, .. } = event {
        assert_eq!(entry.name(), "a.txt");
    }

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    let names: Vec<String> = sink.take().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["E".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_created_directory_is_sized_and_cached() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();

    manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();

    // Fill the directory elsewhere and move it in, so it arrives complete.
    let staging = tempfile::tempdir().unwrap();
    let built = staging.path().join("N");
    fs::create_dir(&built).unwrap();
    fs::write(built.join("n.bin"), vec![0u8; 30]).unwrap();
    let target = dir.path().join("N");
    fs::rename(&built, &target).or_else(|_| {
        fs::create_dir(&target)?;
        fs::write(target.join("n.bin"), vec![0u8; 30])
    })
    .unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, CacheEvent::Change { kind: ChangeKind::Created, entry } if entry.name() == "N")
    })
    .await;
    if let CacheEvent::Change { entry, .. } = event {
        assert!(entry.is_dir());
        assert!(!entry.is_partial());
    }
    assert!(manager.cache_for(dir.path()).unwrap().contains(&target));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rename_updates_entry_in_place() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();

    manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    let original = sink.take().into_iter().find(|s| s.name == "a.txt").unwrap().entry;

    fs::rename(dir.path().join("a.txt"), dir.path().join("z.txt")).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, CacheEvent::Change { kind: ChangeKind::Renamed, .. })
    })
    .await;

    assert_eq!(original.name(), "z.txt");
    let cache = manager.cache_for(dir.path()).unwrap();
    assert!(cache.contains(&dir.path().join("z.txt")));
    assert!(!cache.contains(&dir.path().join("a.txt")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frozen_cache_is_rebuilt() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let sink = Sink::default();
    let token = CancellationToken::new();

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    let first = sink.take();
    let old_cache = manager.cache_for(dir.path()).unwrap();

    // Shrink the TTL of the live cache so it freezes right away.
    old_cache.update_ttl(Duration::from_millis(20));
    wait_until(|| old_cache.is_frozen()).await;
    assert!(old_cache.add(first[0].entry.clone()).is_err());

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    let second = sink.take();
    let new_cache = manager.cache_for(dir.path()).unwrap();

    assert!(!Arc::ptr_eq(&old_cache, &new_cache));
    assert_eq!(old_cache.state(), CacheState::Deleted);
    assert_eq!(second.len(), 2);
    assert!(!Arc::ptr_eq(&first[0].entry, &second[0].entry));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_set_ttl_revives_frozen_cache() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let sink = Sink::default();
    let token = CancellationToken::new();

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    let first = sink.take();
    let cache = manager.cache_for(dir.path()).unwrap();

    cache.update_ttl(Duration::from_millis(20));
    wait_until(|| cache.is_frozen()).await;

    // Changes while frozen are not tracked.
    fs::write(dir.path().join("late.txt"), b"late").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    manager.set_ttl(Duration::from_secs(60));
    assert_eq!(cache.state(), CacheState::Active { partial: true });

    manager.get_entries(dir.path(), &token, &sink, Sink::push).await.unwrap();
    let second = sink.take();
    assert!(Arc::ptr_eq(&manager.cache_for(dir.path()).unwrap(), &cache));
    assert!(Arc::ptr_eq(&first[0].entry, &second[0].entry));
    assert!(second.iter().any(|s| s.name == "late.txt"));
    assert!(!cache.is_partial());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watched_directory_removed_drops_cache() {
    let root = tempfile::tempdir().unwrap();
    let watched = root.path().join("watched");
    fs::create_dir(&watched).unwrap();
    fs::write(watched.join("f"), b"x").unwrap();

    let manager = manager(Duration::from_secs(60));
    let sink = Sink::default();
    manager
        .get_entries(&watched, &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    let cache = manager.cache_for(&watched).unwrap();
    let key = cache.key().clone();
    drop(cache);

    fs::remove_dir_all(&watched).unwrap();
    let registry = manager.registry();
    wait_until(|| manager.cached_paths().is_empty()).await;
    wait_until(|| !registry.is_watched(Path::new(key.as_str()))).await;

    assert!(matches!(
        manager
            .get_entries(&watched, &CancellationToken::new(), &sink, Sink::push)
            .await,
        Err(CacheError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unique_cache_per_path() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));
    let sink = Sink::default();
    let token = CancellationToken::new();

    let with_slash = format!("{}/", dir.path().display());
    let (a, b) = tokio::join!(
        manager.get_entries(dir.path(), &token, &sink, Sink::push),
        manager.get_entries(with_slash.as_str(), &token, &sink, Sink::push),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(manager.cached_paths().len(), 1);
    assert_eq!(manager.registry().len(), 1);
    let cache = manager.cache_for(dir.path()).unwrap();
    assert!(matches!(
        dircache_services::DirectoryCache::new(cache.path(), Duration::from_secs(1), manager.registry()),
        Err(CacheError::AlreadyWatched(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rename_over_existing_name_keeps_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), vec![0u8; 100]).unwrap();
    fs::write(dir.path().join("b.txt"), vec![0u8; 7]).unwrap();
    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();

    manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    let moved = sink.take().into_iter().find(|s| s.name == "a.txt").unwrap().entry;

    fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, CacheEvent::Change { kind: ChangeKind::Renamed, .. })
    })
    .await;

    let cache = manager.cache_for(dir.path()).unwrap();
    let cached: Vec<(String, u64)> = cache.entries().iter().map(|e| (e.name(), e.size())).collect();
    assert_eq!(cached, vec![("b.txt".to_string(), 100)]);
    assert!(Arc::ptr_eq(&cache.entries()[0], &moved));

    manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    let replayed: Vec<(String, u64)> = sink.take().into_iter().map(|s| (s.name, s.size)).collect();
    assert_eq!(replayed, vec![("b.txt".to_string(), 100)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ttl_shorter_than_listing_still_resolves_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("big");
    fs::create_dir(&big).unwrap();
    for i in 0..5000 {
        fs::write(big.join(format!("f{}", i)), b"x").unwrap();
    }
    fs::write(dir.path().join("top.txt"), b"top").unwrap();

    let manager = manager(Duration::from_millis(5));
    let mut events = manager.subscribe();
    let sink = Sink::default();

    let count = manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    assert_eq!(count, 2);
    let seen = sink.take();
    let big_entry = &seen.iter().find(|s| s.name == "big").unwrap().entry;
    assert!(!big_entry.is_partial());
    assert_eq!(big_entry.size(), 5000);

    let done = wait_for(&mut events, |e| matches!(e, CacheEvent::Completed { .. })).await;
    assert!(matches!(
        done,
        CacheEvent::Completed {
            status: CompletionStatus::Completed,
            ..
        }
    ));

    // Expiry resumes once the listing is over.
    let cache = manager.cache_for(dir.path()).unwrap();
    assert!(!cache.is_busy());
    wait_until(|| cache.is_frozen()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_reported_for_directory_and_subdirectories() {
    let dir = scenario_tree();
    fs::create_dir(dir.path().join("F")).unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();

    manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();

    let mut progress = Vec::new();
    loop {
        match wait_for(&mut events, |e| {
            matches!(e, CacheEvent::Progress { .. } | CacheEvent::Completed { .. })
        })
        .await
        {
            CacheEvent::Progress { path } => progress.push(path),
            _ => break,
        }
    }
    assert_eq!(progress[0], root, "the listed directory is announced first");
    assert!(progress.contains(&root.join("E")));
    assert!(progress.contains(&root.join("F")));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreadable_subdirectory_reports_exception() {
    use std::os::unix::fs::PermissionsExt;

    let dir = scenario_tree();
    let locked = dir.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::write(locked.join("hidden"), vec![0u8; 9]).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&locked).is_ok() {
        // Permissions are not enforced for this user.
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let manager = manager(Duration::from_secs(60));
    let mut events = manager.subscribe();
    let sink = Sink::default();
    let result = manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await;
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    assert_eq!(result.unwrap(), 3);
    let event = wait_for(&mut events, |e| matches!(e, CacheEvent::Exception { .. })).await;
    if let CacheEvent::Exception { path, error } = event {
        assert_eq!(path.file_name().unwrap(), "locked");
        assert!(!error.is_empty());
    }

    let seen = sink.take();
    let e = &seen.iter().find(|s| s.name == "E").unwrap().entry;
    assert_eq!(e.size(), 50, "siblings are unaffected");
    let locked_entry = &seen.iter().find(|s| s.name == "locked").unwrap().entry;
    assert!(!locked_entry.is_partial());
    assert_eq!(locked_entry.size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_racing_listings_keeps_registry_in_step() {
    let dir = scenario_tree();
    let manager = manager(Duration::from_secs(60));

    let lister = {
        let manager = manager.clone();
        let path = dir.path().to_path_buf();
        tokio::spawn(async move {
            let sink = Sink::default();
            for _ in 0..200 {
                match manager
                    .get_entries(&path, &CancellationToken::new(), &sink, Sink::push)
                    .await
                {
                    Ok(_) | Err(CacheError::Cancelled) => {},
                    Err(e) => panic!("listing failed while resetting: {}", e),
                }
                sink.take();
            }
        })
    };
    for _ in 0..200 {
        manager.reset();
        tokio::task::yield_now().await;
    }
    lister.await.unwrap();

    let sink = Sink::default();
    manager
        .get_entries(dir.path(), &CancellationToken::new(), &sink, Sink::push)
        .await
        .unwrap();
    assert_eq!(manager.cached_paths().len(), 1);
    assert_eq!(manager.registry().len(), 1);
    let cache = manager.cache_for(dir.path()).unwrap();
    assert!(matches!(
        dircache_services::DirectoryCache::new(cache.path(), Duration::from_secs(1), manager.registry()),
        Err(CacheError::AlreadyWatched(_))
    ));
}
