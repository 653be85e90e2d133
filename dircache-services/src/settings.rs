// SPDX-License-Identifier: LGPL-3.0-only
//! Cache configuration and its on-disk settings.

use anyhow::Result;
use dircache_core::events::DEFAULT_EVENT_CAPACITY;
use dircache_core::size::default_fan_out_budget;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time a directory cache survives without activity.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Runtime configuration of a [`crate::CacheManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied to new directory caches.
    pub ttl: Duration,
    /// How many size jobs may run as independent tasks at once.
    pub fan_out_budget: usize,
    /// Buffer of the manager's event channel.
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            fan_out_budget: default_fan_out_budget(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// The `config.toml` file as read from disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// `[cache]` section.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Any other sections are captured here
    #[serde(flatten)]
    pub other: HashMap<String, toml::Value>,
}

/// `[cache]` section of `config.toml`. Unset keys keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
    /// Idle time in seconds before a directory cache freezes.
    pub ttl_secs: Option<u64>,
    /// Sub-directories sized in parallel across the whole manager.
    pub fan_out_budget: Option<usize>,
    /// Buffer of the application event channel.
    pub event_capacity: Option<usize>,
}

/// Registry for the cache settings.
#[derive(Debug, Default)]
pub struct SettingsRegistry {
    config: Config,
}

impl SettingsRegistry {
    /// Create a new SettingsRegistry and load configuration from standard locations.
    pub async fn new() -> Result<Self> {
        let mut registry = Self::default();
        registry.load().await?;
        Ok(registry)
    }

    /// Load configuration from standard locations in precedence order.
    ///
    /// Order (later overrides earlier):
    /// 1. System Data: /usr/share/dircache/config.toml (and XDG_DATA_DIRS)
    /// 2. System Config: /etc/xdg/dircache/config.toml (and XDG_CONFIG_DIRS)
    /// 3. User Config: ~/.config/dircache/config.toml (XDG_CONFIG_HOME)
    #[cfg(unix)]
    pub async fn load(&mut self) -> Result<()> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("dircache")?;
        let filename = "config.toml";

        for path in xdg_dirs.find_data_files(filename).rev() {
            self.load_file(&path).await;
        }
        for path in xdg_dirs.find_config_files(filename).rev() {
            self.load_file(&path).await;
        }
        let user_config_path = xdg_dirs.get_config_home().join(filename);
        if user_config_path.exists() {
            self.load_file(&user_config_path).await;
        }
        Ok(())
    }

    /// No standard locations outside XDG platforms; use
    /// [`SettingsRegistry::load_from_paths_async`].
    #[cfg(not(unix))]
    pub async fn load(&mut self) -> Result<()> {
        Ok(())
    }

    async fn load_file(&mut self, path: &Path) {
        log::info!("Loading config from: {:?}", path);
        match smol::fs::read_to_string(path).await {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(loaded_config) => self.merge(loaded_config),
                Err(e) => {
                    log::error!("Failed to parse config file {:?}: {}", path, e);
                },
            },
            Err(e) => {
                log::warn!("Failed to read config file {:?}: {}", path, e);
            },
        }
    }

    /// Merge a loaded config into the current config.
    fn merge(&mut self, other: Config) {
        let cache = &mut self.config.cache;
        if other.cache.ttl_secs.is_some() {
            cache.ttl_secs = other.cache.ttl_secs;
        }
        if other.cache.fan_out_budget.is_some() {
            cache.fan_out_budget = other.cache.fan_out_budget;
        }
        if other.cache.event_capacity.is_some() {
            cache.event_capacity = other.cache.event_capacity;
        }
        self.config.other.extend(other.other);
    }

    /// Get the current configuration.
    pub fn get(&self) -> &Config {
        &self.config
    }

    /// Resolve the loaded settings into a [`CacheConfig`].
    pub fn cache_config(&self) -> CacheConfig {
        let defaults = CacheConfig::default();
        let cache = &self.config.cache;
        CacheConfig {
            ttl: cache.ttl_secs.map(Duration::from_secs).unwrap_or(defaults.ttl),
            fan_out_budget: cache.fan_out_budget.unwrap_or(defaults.fan_out_budget),
            event_capacity: cache
                .event_capacity
                .filter(|capacity| *capacity > 0)
                .unwrap_or(defaults.event_capacity),
        }
    }

    /// Load configuration from multiple custom paths asynchronously.
    pub async fn load_from_paths_async(&mut self, paths: Vec<PathBuf>) -> Vec<Result<()>> {
        let mut results = Vec::new();

        for path in paths {
            let result = async {
                let content = smol::fs::read_to_string(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;

                let loaded_config: Config = toml::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", path, e))?;

                self.merge(loaded_config);
                Ok(())
            }
            .await;

            results.push(result);
        }

        results
    }

    /// Reload configuration asynchronously (re-runs the full load process).
    pub async fn reload_async(&mut self) -> Result<()> {
        *self = Self::default();
        self.load().await
    }
}
