use crate::error::{GriddleError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime tunables for the worker pools and the indexing queue.
///
/// Loaded from a JSON file when one exists, otherwise built from defaults
/// with `GRIDDLE_*` environment overrides applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of threads in the search pool.
    pub search_pool_size: usize,
    /// Number of threads in the index pool when CPU auto-sizing is off or
    /// detection fails.
    pub index_pool_size: usize,
    /// Disable sizing the index pool from the online processor count.
    pub pool_size_no_auto: bool,
    /// Indexing worker timed-wait interval, in milliseconds.
    pub index_queue_interval_ms: u64,
    /// Live-dict size at which a sub-queue triggers an early worker wakeup.
    pub index_batch_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            search_pool_size: 20,
            index_pool_size: 8,
            pool_size_no_auto: false,
            index_queue_interval_ms: 100,
            index_batch_size: 100,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file, or fall back to defaults plus
    /// environment overrides when the file is missing or unparseable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<RuntimeConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded runtime config: search_pool={}, index_pool={}, batch={}",
                            config.search_pool_size,
                            config.index_pool_size,
                            config.index_batch_size
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse {}: {}, using defaults", path.display(), e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read {}: {}, using defaults", path.display(), e);
                }
            }
        }
        Self::from_env()
    }

    /// Defaults with `GRIDDLE_*` environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_usize("GRIDDLE_SEARCH_POOL_SIZE") {
            config.search_pool_size = n;
        }
        if let Some(n) = env_usize("GRIDDLE_INDEX_POOL_SIZE") {
            config.index_pool_size = n;
        }
        if std::env::var("GRIDDLE_POOL_SIZE_NO_AUTO").is_ok_and(|v| v == "1" || v == "true") {
            config.pool_size_no_auto = true;
        }
        if let Some(n) = env_usize("GRIDDLE_INDEX_QUEUE_INTERVAL_MS") {
            config.index_queue_interval_ms = n as u64;
        }
        if let Some(n) = env_usize("GRIDDLE_INDEX_BATCH_SIZE") {
            config.index_batch_size = n;
        }
        config
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.search_pool_size == 0 {
            return Err(GriddleError::Config(
                "search_pool_size must be at least 1".into(),
            ));
        }
        if self.index_pool_size == 0 {
            return Err(GriddleError::Config(
                "index_pool_size must be at least 1".into(),
            ));
        }
        if self.index_batch_size == 0 {
            return Err(GriddleError::Config(
                "index_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
