//! Database builder for fluent configuration
//!
//! Every setting of [`EngineConfig`] is reachable from the builder.

use std::sync::Arc;
use std::time::Duration;

use epochkv_core::Result;

use super::{Database, EngineConfig};

// ============================================================================
// Database Builder Pattern
// ============================================================================

/// Builder for Database configuration
///
/// ```ignore
/// use epochkv_engine::Database;
///
/// // Background epoch thread with 10 ms epochs
/// let db = Database::builder()
///     .epoch_duration(Duration::from_millis(10))
///     .open()?;
///
/// // Epochs driven by the caller (tests, custom schedulers)
/// let db = Database::builder().manual_epochs().open()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct DatabaseBuilder {
    config: EngineConfig,
}

impl DatabaseBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Epoch length of the background ticker.
    pub fn epoch_duration(mut self, epoch: Duration) -> Self {
        self.config.epoch_duration_ms = (epoch.as_millis() as u64).max(1);
        self
    }

    /// No ticker; the epoch only moves through `Database::advance_epoch`.
    pub fn manual_epochs(mut self) -> Self {
        self.config.epoch_duration_ms = 0;
        self
    }

    /// Enable or disable the garbage collector.
    pub fn gc(mut self, enabled: bool) -> Self {
        self.config.gc_enabled = enabled;
        self
    }

    /// Number of session slots.
    pub fn max_sessions(mut self, n: usize) -> Self {
        self.config.max_sessions = n;
        self
    }

    /// Reservation slots per storage.
    pub fn max_write_preserves_per_storage(mut self, n: usize) -> Self {
        self.config.max_write_preserves_per_storage = n;
        self
    }

    /// Busy-wait budget of every retry loop.
    pub fn spin_retry_limit(mut self, n: usize) -> Self {
        self.config.spin_retry_limit = n;
        self
    }

    /// Statistics log period in epochs (`0` = never).
    pub fn stats_log_interval_epochs(mut self, n: u64) -> Self {
        self.config.stats_log_interval_epochs = n;
        self
    }

    /// Configuration built so far.
    pub fn build_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the database.
    pub fn open(self) -> Result<Arc<Database>> {
        Database::open(self.config)
    }
}
