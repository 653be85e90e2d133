use dircache::prelude::*;
use std::path::PathBuf;
use std::sync::Mutex;

fn describe(entry: &Entry) -> String {
    if entry.is_partial() {
        format!("{:<40} {:>12}", entry.name(), "...")
    } else {
        format!("{:<40} {:>12}", entry.name(), entry.size())
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = match SettingsRegistry::new().await {
        Ok(settings) => settings.cache_config(),
        Err(e) => {
            log::warn!("Using default settings: {}", e);
            CacheConfig::default()
        },
    };
    let manager = CacheManager::new(config);
    let mut events = manager.subscribe();

    let listed = Mutex::new(Vec::new());
    let cancel = CancellationToken::new();
    let result = manager
        .get_entries(&dir, &cancel, &listed, |sink, entry| {
            println!("{}", describe(&entry));
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
        })
        .await;

    match result {
        Ok(count) => println!("-- {} entries", count),
        Err(e) => {
            eprintln!("Could not list {:?}: {}", dir, e);
            std::process::exit(1);
        },
    }

    let mut listed = listed.into_inner().unwrap_or_else(|e| e.into_inner());
    listed.sort_by(|a, b| a.display_cmp(b));
    println!("-- sorted, directories resolved");
    for entry in &listed {
        println!("{}", describe(entry));
    }

    println!("-- watching for changes, Ctrl+C to quit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(CacheEvent::Change { entry, kind }) => println!("{:?}: {}", kind, describe(&entry)),
                Ok(CacheEvent::Exception { path, error }) => eprintln!("{:?}: {}", path, error),
                Ok(_) => {},
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Dropped {} events", n);
                },
                Err(_) => break,
            },
        }
    }
    manager.reset();
}
