//! Database: the embeddable engine facade
//!
//! A `Database` owns one transaction coordinator and, unless the epoch is
//! driven manually, the background epoch and GC workers.
//!
//! ## Usage
//!
//! ```ignore
//! use epochkv_engine::{Database, TxOptions};
//!
//! let db = Database::builder().manual_epochs().open()?;
//! let table = db.create_storage(None)?;
//!
//! let s = db.enter()?;
//! db.begin(s, &TxOptions::short())?;
//! db.insert(s, table, b"k", b"v")?;
//! db.commit(s)?;
//! db.leave(s)?;
//! ```

mod builder;
mod config;

pub use builder::DatabaseBuilder;
pub use config::{EngineConfig, CONFIG_FILE_NAME};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use epochkv_concurrency::{CommitStatus, ScanHandle, SessionId, TxOptions, TxState};
use epochkv_core::{Epoch, Error, Result, ResultInfo, ScanEndpoint, StorageId};
use epochkv_storage::StorageStats;
use tracing::info;

use crate::background::BackgroundWorkers;
use crate::coordinator::{TransactionCoordinator, TransactionMetrics};

/// Embedded transactional key-value engine.
///
/// All methods take `&self`; share the database between worker threads
/// through the `Arc` returned by [`Database::open`]. Each thread enters its
/// own session and runs one transaction at a time on it.
#[derive(Debug)]
pub struct Database {
    coordinator: Arc<TransactionCoordinator>,
    config: EngineConfig,
    workers: BackgroundWorkers,
    /// Cleared by `shutdown`; new sessions and transactions are refused
    accepting: AtomicBool,
}

impl Database {
    /// Open an engine with `config`.
    pub fn open(config: EngineConfig) -> Result<Arc<Database>> {
        config.validate()?;
        let coordinator = Arc::new(TransactionCoordinator::new(
            &config.concurrency(),
            config.gc_enabled,
        ));
        let workers = match config.epoch_duration() {
            Some(epoch) => BackgroundWorkers::start(
                Arc::clone(&coordinator),
                epoch,
                config.stats_log_interval_epochs,
            )?,
            None => BackgroundWorkers::manual(),
        };
        info!(
            target: "epochkv::engine",
            epoch_ms = config.epoch_duration_ms,
            gc = config.gc_enabled,
            max_sessions = config.max_sessions,
            "engine opened"
        );
        Ok(Arc::new(Database {
            coordinator,
            config,
            workers,
            accepting: AtomicBool::new(true),
        }))
    }

    /// Open with the settings of a config file, creating a commented
    /// default file first when it does not exist.
    pub fn open_with_config_file(path: &Path) -> Result<Arc<Database>> {
        EngineConfig::write_default_if_missing(path)?;
        Self::open(EngineConfig::from_file(path)?)
    }

    /// Builder for fluent configuration.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Settings the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether `shutdown` has not been called yet.
    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ShutDown)
        }
    }

    /// Transaction coordinator, for callers that need the manager directly.
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    // ========================================================================
    // Sessions and transactions
    // ========================================================================

    /// Claim a session.
    pub fn enter(&self) -> Result<SessionId> {
        self.ensure_open()?;
        self.coordinator.enter()
    }

    /// Release a session, aborting its running transaction.
    pub fn leave(&self, sid: SessionId) -> Result<()> {
        self.coordinator.leave(sid)
    }

    /// Begin a transaction on `sid`.
    pub fn begin(&self, sid: SessionId, options: &TxOptions) -> Result<()> {
        self.ensure_open()?;
        self.coordinator.begin(sid, options)
    }

    /// Commit; long transactions may answer `WaitingForOtherTx`.
    pub fn commit(&self, sid: SessionId) -> Result<CommitStatus> {
        self.coordinator.commit(sid)
    }

    /// Poll a waiting long transaction.
    pub fn check_commit(&self, sid: SessionId) -> Result<CommitStatus> {
        self.coordinator.check_commit(sid)
    }

    /// Abort.
    pub fn abort(&self, sid: SessionId) -> Result<()> {
        self.coordinator.abort(sid)
    }

    /// State of the session's transaction.
    pub fn tx_state(&self, sid: SessionId) -> Result<TxState> {
        self.coordinator.tx_state(sid)
    }

    /// Why the session's last transaction aborted.
    pub fn result_info(&self, sid: SessionId) -> Result<Option<ResultInfo>> {
        self.coordinator.result_info(sid)
    }

    // ========================================================================
    // Point operations
    // ========================================================================

    /// Value of `key`, or `NotFound`.
    pub fn search_key(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<Vec<u8>> {
        self.coordinator.search_key(sid, storage, key)
    }

    /// Whether `key` exists.
    pub fn exist_key(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<bool> {
        self.coordinator.exist_key(sid, storage, key)
    }

    /// Insert a new key.
    pub fn insert(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        self.coordinator.insert(sid, storage, key, value)
    }

    /// Overwrite an existing key.
    pub fn update(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        self.coordinator.update(sid, storage, key, value)
    }

    /// Insert or overwrite.
    pub fn upsert(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        self.coordinator.upsert(sid, storage, key, value)
    }

    /// Delete an existing key.
    pub fn delete_record(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<()> {
        self.coordinator.delete_record(sid, storage, key)
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// Open a scan; `max == 0` means no limit.
    #[allow(clippy::too_many_arguments)]
    pub fn open_scan(
        &self,
        sid: SessionId,
        storage: StorageId,
        lower: &[u8],
        lower_endpoint: ScanEndpoint,
        upper: &[u8],
        upper_endpoint: ScanEndpoint,
        max: usize,
    ) -> Result<ScanHandle> {
        self.coordinator
            .open_scan(sid, storage, lower, lower_endpoint, upper, upper_endpoint, max)
    }

    /// Advance a scan cursor.
    pub fn next_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<()> {
        self.coordinator.manager().next_scan(sid, handle)
    }

    /// Key under the cursor.
    pub fn read_key_from_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<Vec<u8>> {
        self.coordinator.manager().read_key_from_scan(sid, handle)
    }

    /// Value under the cursor.
    pub fn read_value_from_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<Vec<u8>> {
        self.coordinator.manager().read_value_from_scan(sid, handle)
    }

    /// Close a scan.
    pub fn close_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<()> {
        self.coordinator.manager().close_scan(sid, handle)
    }

    /// Entries cached by the scan.
    pub fn scannable_total_index_size(&self, sid: SessionId, handle: ScanHandle) -> Result<usize> {
        self.coordinator
            .manager()
            .scannable_total_index_size(sid, handle)
    }

    // ========================================================================
    // Storage administration
    // ========================================================================

    /// Create a storage, allocating an id when none is given.
    pub fn create_storage(&self, id: Option<StorageId>) -> Result<StorageId> {
        self.ensure_open()?;
        self.coordinator.manager().create_storage(id)
    }

    /// Create a storage under a caller-chosen id.
    pub fn register_storage(&self, id: StorageId) -> Result<()> {
        self.ensure_open()?;
        self.coordinator.manager().register_storage(id)
    }

    /// Drop a storage.
    pub fn delete_storage(&self, id: StorageId) -> Result<()> {
        self.coordinator.manager().delete_storage(id)
    }

    /// Whether a storage exists.
    pub fn exist_storage(&self, id: StorageId) -> bool {
        self.coordinator.manager().exist_storage(id)
    }

    /// All storage ids, ascending.
    pub fn list_storage(&self) -> Vec<StorageId> {
        self.coordinator.manager().list_storage()
    }

    // ========================================================================
    // Epochs and diagnostics
    // ========================================================================

    /// Current epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.coordinator.manager().clock().current()
    }

    /// Tick the clock, recompute the floors, and run one GC pass when GC is
    /// enabled. Returns the new epoch.
    pub fn advance_epoch(&self) -> Epoch {
        self.coordinator.advance_epoch()
    }

    /// Per-storage statistics from the last GC sweep.
    pub fn storage_stats(&self) -> Vec<StorageStats> {
        self.coordinator.storage_stats()
    }

    /// Transaction counters.
    pub fn metrics(&self) -> TransactionMetrics {
        self.coordinator.metrics()
    }

    /// Stop the workers, abort every running transaction and free all
    /// garbage. Later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.workers.stop();
        self.coordinator.manager().shutdown();
        let metrics = self.metrics();
        info!(
            target: "epochkv::engine",
            committed = metrics.total_committed(),
            aborted = metrics.total_aborted(),
            "engine shut down"
        );
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}
