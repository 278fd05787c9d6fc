use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::PathBuf;

/// Tunables for the synchronization core. Loaded from (and saved to) a JSON
/// file under the user's config directory; every field has a sane default so
/// a missing file is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base backoff delay d0, in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff cap dMax, in milliseconds.
    pub backoff_cap_ms: u64,
    /// Maximum retry attempts per message before it is terminally failed.
    pub max_send_attempts: u32,
    /// Maximum automatic reconnect attempts before the connection errors out.
    pub max_reconnect_attempts: u32,
    /// Maximum messages per outbound batch.
    pub batch_size: usize,
    /// Default send rate limit; the server's hint overrides this.
    pub rate_limit_per_minute: u32,
    /// Offline queue capacity; oldest non-critical entries are evicted past it.
    pub offline_queue_capacity: usize,
    /// Notification debounce window, in milliseconds.
    pub debounce_window_ms: u64,
    /// Bounded capacity of the recent-notification queue.
    pub notification_capacity: usize,
    /// How long terminal messages are kept before TTL garbage collection,
    /// in seconds. Acknowledged messages are collected immediately.
    pub terminal_ttl_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            max_send_attempts: 3,
            max_reconnect_attempts: 5,
            batch_size: 50,
            rate_limit_per_minute: 60,
            offline_queue_capacity: 1000,
            debounce_window_ms: 250,
            notification_capacity: 100,
            terminal_ttl_secs: 3600,
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("courier");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    // COURIER_CONFIG overrides the default location
    if let Ok(path) = std::env::var("COURIER_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    Ok(get_config_dir()?.join("config.json"))
}

pub fn load_config() -> Result<SyncConfig> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        info!("No config file at {:?}, using defaults", config_path);
        return Ok(SyncConfig::default());
    }

    let file = File::open(&config_path)?;
    let config: SyncConfig = serde_json::from_reader(file)?;
    info!("Loaded config from {:?}", config_path);
    Ok(config)
}

pub fn save_config(config: &SyncConfig) -> Result<()> {
    let config_path = get_config_path()?;
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(&config_path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Config saved to {:?}", config_path);
    Ok(())
}
