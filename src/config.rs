//! Configuration for the sync engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("contact-sync")
}

/// Engine configuration.
///
/// Timing fields are tunable so tests can shrink the debounce and backoff
/// windows instead of sleeping for real-world durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Storage directory for the database and blobs
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Delay before a drain after a local write, coalescing edit bursts
    #[serde(default = "default_drain_debounce_ms")]
    pub drain_debounce_ms: u64,

    /// Per-item retry ceiling; items failing more often are dead-lettered
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Retries for auth-shaped remote failures inside a guarded call
    #[serde(default = "default_auth_retries")]
    pub auth_retries: u32,

    /// Base backoff for auth retries; doubles per attempt (2s, 4s, 8s)
    #[serde(default = "default_auth_backoff_ms")]
    pub auth_backoff_ms: u64,

    /// How close to expiry a session triggers a refresh
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: u64,

    /// Window in which a duplicate signed-out event is dropped
    #[serde(default = "default_signed_out_debounce_ms")]
    pub signed_out_debounce_ms: u64,
}

fn default_drain_debounce_ms() -> u64 {
    2000
}

fn default_retry_ceiling() -> u32 {
    5
}

fn default_auth_retries() -> u32 {
    3
}

fn default_auth_backoff_ms() -> u64 {
    2000
}

fn default_refresh_window_secs() -> u64 {
    60
}

fn default_signed_out_debounce_ms() -> u64 {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            drain_debounce_ms: default_drain_debounce_ms(),
            retry_ceiling: default_retry_ceiling(),
            auth_retries: default_auth_retries(),
            auth_backoff_ms: default_auth_backoff_ms(),
            refresh_window_secs: default_refresh_window_secs(),
            signed_out_debounce_ms: default_signed_out_debounce_ms(),
        }
    }
}

impl SyncConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Config suited for tests: tight timing, no real backoff waits.
    pub fn for_tests(storage_dir: PathBuf) -> Self {
        Self {
            storage_dir,
            drain_debounce_ms: 10,
            auth_backoff_ms: 5,
            signed_out_debounce_ms: 100,
            ..Default::default()
        }
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("records.sled")
    }

    /// Get blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn drain_debounce(&self) -> Duration {
        Duration::from_millis(self.drain_debounce_ms)
    }

    pub fn auth_backoff(&self) -> Duration {
        Duration::from_millis(self.auth_backoff_ms)
    }

    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window_secs)
    }

    pub fn signed_out_debounce(&self) -> Duration {
        Duration::from_millis(self.signed_out_debounce_ms)
    }
}
