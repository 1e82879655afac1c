//! Transaction coordinator
//!
//! The TransactionCoordinator wraps the TransactionManager and adds:
//! - Transaction metrics per kind (started, committed, aborted, waiting)
//! - The per-epoch duties: floors, sweep and reclaim

use std::sync::atomic::{AtomicU64, Ordering};

use epochkv_concurrency::{
    CommitStatus, ConcurrencyConfig, ScanHandle, SessionId, SweepReport, TransactionManager, TxOptions,
    TxState,
};
use epochkv_core::{Epoch, Result, ResultInfo, ScanEndpoint, StorageId, TxKind};
use epochkv_storage::StorageStats;
use serde::Serialize;
use tracing::trace;

/// Counters of one transaction kind.
///
/// Relaxed ordering: the counters are observational and synchronize nothing.
#[derive(Debug, Default)]
struct KindCounters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    waiting: AtomicU64,
}

impl KindCounters {
    fn snapshot(&self) -> KindMetrics {
        KindMetrics {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }
}

/// Counts of one transaction kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindMetrics {
    /// Transactions begun
    pub started: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions aborted, by conflict or by request
    pub aborted: u64,
    /// Commit calls answered with `WaitingForOtherTx`
    pub waiting: u64,
}

/// Transaction metrics
///
/// Provides statistics about transaction lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionMetrics {
    /// Short transactions
    pub short: KindMetrics,
    /// Long transactions
    pub long: KindMetrics,
    /// Read-only transactions
    pub read_only: KindMetrics,
}

impl TransactionMetrics {
    /// Total transactions begun.
    pub fn total_started(&self) -> u64 {
        self.short.started + self.long.started + self.read_only.started
    }

    /// Total transactions committed.
    pub fn total_committed(&self) -> u64 {
        self.short.committed + self.long.committed + self.read_only.committed
    }

    /// Total transactions aborted.
    pub fn total_aborted(&self) -> u64 {
        self.short.aborted + self.long.aborted + self.read_only.aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        let started = self.total_started();
        if started > 0 {
            self.total_aborted() as f64 / started as f64
        } else {
            0.0
        }
    }
}

/// Transaction manager plus metrics and epoch duties.
#[derive(Debug)]
pub struct TransactionCoordinator {
    manager: TransactionManager,
    short: KindCounters,
    long: KindCounters,
    read_only: KindCounters,
    gc_enabled: bool,
}

impl TransactionCoordinator {
    /// Coordinator over a fresh manager.
    pub fn new(config: &ConcurrencyConfig, gc_enabled: bool) -> Self {
        Self {
            manager: TransactionManager::new(config),
            short: KindCounters::default(),
            long: KindCounters::default(),
            read_only: KindCounters::default(),
            gc_enabled,
        }
    }

    /// Underlying manager.
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    fn counters(&self, kind: TxKind) -> &KindCounters {
        match kind {
            TxKind::Short => &self.short,
            TxKind::Long => &self.long,
            TxKind::ReadOnly => &self.read_only,
        }
    }

    /// Count an abort reported by any operation on `sid`.
    fn track<T>(&self, sid: SessionId, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_abort() {
                if let Ok(Some(kind)) = self.manager.tx_kind(sid) {
                    self.counters(kind).aborted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        result
    }

    fn track_commit(&self, sid: SessionId, result: Result<CommitStatus>) -> Result<CommitStatus> {
        if let Ok(status) = &result {
            if let Ok(Some(kind)) = self.manager.tx_kind(sid) {
                let counters = self.counters(kind);
                match status {
                    CommitStatus::Committed => counters.committed.fetch_add(1, Ordering::Relaxed),
                    CommitStatus::WaitingForOtherTx => counters.waiting.fetch_add(1, Ordering::Relaxed),
                };
            }
        }
        self.track(sid, result)
    }

    /// Snapshot of the metrics.
    pub fn metrics(&self) -> TransactionMetrics {
        TransactionMetrics {
            short: self.short.snapshot(),
            long: self.long.snapshot(),
            read_only: self.read_only.snapshot(),
        }
    }

    // ========================================================================
    // Sessions and lifecycle
    // ========================================================================

    /// Claim a session slot.
    pub fn enter(&self) -> Result<SessionId> {
        self.manager.enter()
    }

    /// Release a session slot, aborting its running transaction.
    pub fn leave(&self, sid: SessionId) -> Result<()> {
        let running = matches!(
            self.manager.tx_state(sid),
            Ok(TxState::Active | TxState::Committing | TxState::WaitingForOtherTx)
        );
        let kind = self.manager.tx_kind(sid).ok().flatten();
        self.manager.leave(sid)?;
        if let (true, Some(kind)) = (running, kind) {
            self.counters(kind).aborted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Begin a transaction.
    pub fn begin(&self, sid: SessionId, options: &TxOptions) -> Result<()> {
        self.manager.begin(sid, options)?;
        self.counters(options.kind())
            .started
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Commit.
    pub fn commit(&self, sid: SessionId) -> Result<CommitStatus> {
        let result = self.manager.commit(sid);
        self.track_commit(sid, result)
    }

    /// Poll a waiting long transaction.
    pub fn check_commit(&self, sid: SessionId) -> Result<CommitStatus> {
        let was_waiting = matches!(self.manager.tx_state(sid), Ok(TxState::WaitingForOtherTx));
        let result = self.manager.check_commit(sid);
        if was_waiting {
            self.track_commit(sid, result)
        } else {
            result
        }
    }

    /// Abort.
    pub fn abort(&self, sid: SessionId) -> Result<()> {
        let kind = self.manager.tx_kind(sid).ok().flatten();
        self.manager.abort(sid)?;
        if let Some(kind) = kind {
            self.counters(kind).aborted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Transaction state.
    pub fn tx_state(&self, sid: SessionId) -> Result<TxState> {
        self.manager.tx_state(sid)
    }

    /// Reason of the last abort.
    pub fn result_info(&self, sid: SessionId) -> Result<Option<ResultInfo>> {
        self.manager.result_info(sid)
    }

    // ========================================================================
    // Data operations
    // ========================================================================

    /// Point read.
    pub fn search_key(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<Vec<u8>> {
        let result = self.manager.search_key(sid, storage, key);
        self.track(sid, result)
    }

    /// Existence check.
    pub fn exist_key(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<bool> {
        let result = self.manager.exist_key(sid, storage, key);
        self.track(sid, result)
    }

    /// Insert.
    pub fn insert(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.manager.insert(sid, storage, key, value);
        self.track(sid, result)
    }

    /// Update.
    pub fn update(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.manager.update(sid, storage, key, value);
        self.track(sid, result)
    }

    /// Upsert.
    pub fn upsert(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.manager.upsert(sid, storage, key, value);
        self.track(sid, result)
    }

    /// Delete.
    pub fn delete_record(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<()> {
        let result = self.manager.delete_record(sid, storage, key);
        self.track(sid, result)
    }

    /// Open a scan.
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
        let result = self
            .manager
            .open_scan(sid, storage, lower, lower_endpoint, upper, upper_endpoint, max);
        self.track(sid, result)
    }

    // ========================================================================
    // Epoch duties
    // ========================================================================

    /// Work done once per epoch: floors, then (if enabled) sweep and
    /// reclaim. The clock must already have been advanced.
    pub fn on_epoch(&self) -> Option<SweepReport> {
        self.manager.compute_floors();
        if !self.gc_enabled {
            return None;
        }
        let (report, freed) = self.manager.collect_garbage();
        trace!(target: "epochkv::gc", unhooked = report.unhooked, freed, "epoch duties");
        Some(report)
    }

    /// Advance the clock and run the epoch duties inline.
    pub fn advance_epoch(&self) -> Epoch {
        let epoch = self.manager.clock().advance();
        self.on_epoch();
        epoch
    }

    /// Statistics gathered by the last sweep.
    pub fn storage_stats(&self) -> Vec<StorageStats> {
        self.manager.storage_stats()
    }
}
