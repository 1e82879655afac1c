//! Engine configuration via `epochkv.toml`
//!
//! Every knob has a default, so an empty file (or no file at all) yields a
//! working engine. `write_default_if_missing` drops a commented default file
//! next to the caller's data so the settings are discoverable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use epochkv_concurrency::ConcurrencyConfig;
use epochkv_core::{Error, Result};

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "epochkv.toml";

/// Engine configuration loaded from `epochkv.toml`.
///
/// # Example
///
/// ```toml
/// # Epoch length in milliseconds; 0 = advance manually
/// epoch_duration_ms = 40
/// gc_enabled = true
/// max_sessions = 128
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Epoch length in milliseconds. `0` disables the ticker; the epoch then
    /// only moves through `Database::advance_epoch`.
    pub epoch_duration_ms: u64,
    /// Run the garbage collector on every epoch.
    pub gc_enabled: bool,
    /// Number of session slots.
    pub max_sessions: usize,
    /// Write-preserve reservation slots per storage.
    pub max_write_preserves_per_storage: usize,
    /// Busy-wait budget of every retry loop.
    pub spin_retry_limit: usize,
    /// Log per-storage statistics every this many epochs (`0` = never).
    pub stats_log_interval_epochs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let concurrency = ConcurrencyConfig::default();
        Self {
            epoch_duration_ms: 40,
            gc_enabled: true,
            max_sessions: concurrency.max_sessions,
            max_write_preserves_per_storage: concurrency.max_write_preserves_per_storage,
            spin_retry_limit: concurrency.spin_retry_limit,
            stats_log_interval_epochs: 250,
        }
    }
}

impl EngineConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# epochkv engine configuration
#
# Epoch length in milliseconds (default: 40).
# 0 disables the epoch thread; call Database::advance_epoch() instead.
epoch_duration_ms = 40

# Reclaim deleted keys and old versions on every epoch (default: true)
gc_enabled = true

# Maximum number of concurrently entered sessions (default: 128)
max_sessions = 128

# Long transactions that may write-preserve one storage at a time (default: 64)
max_write_preserves_per_storage = 64

# Busy-wait budget for locked records and concurrent inserts (default: 10000)
spin_retry_limit = 10000

# Log per-storage statistics every N epochs, 0 = never (default: 250)
stats_log_interval_epochs = 250
"#
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1".to_string()));
        }
        if self.max_write_preserves_per_storage == 0 {
            return Err(Error::Config(
                "max_write_preserves_per_storage must be at least 1".to_string(),
            ));
        }
        if self.spin_retry_limit == 0 {
            return Err(Error::Config("spin_retry_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Epoch length, or `None` for manual epochs.
    pub fn epoch_duration(&self) -> Option<Duration> {
        (self.epoch_duration_ms > 0).then(|| Duration::from_millis(self.epoch_duration_ms))
    }

    /// Limits handed to the concurrency layer.
    pub fn concurrency(&self) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_sessions: self.max_sessions,
            spin_retry_limit: self.spin_retry_limit,
            max_write_preserves_per_storage: self.max_write_preserves_per_storage,
        }
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
