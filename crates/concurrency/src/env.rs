//! Shared transaction environment
//!
//! Everything the three transaction engines need besides their own context:
//! the epoch clock, the storages, the busy-wait budget and the long
//! transaction id counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use epochkv_core::{EpochClock, LtxId, Result, StorageId};
use epochkv_storage::{Storage, StorageRegistry};
use parking_lot::{Mutex, MutexGuard};

/// Limits of the concurrency layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Number of session slots
    pub max_sessions: usize,
    /// Busy-wait budget of every retry loop
    pub spin_retry_limit: usize,
    /// Reservation slots per storage
    pub max_write_preserves_per_storage: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            max_sessions: 128,
            spin_retry_limit: 10_000,
            max_write_preserves_per_storage: 64,
        }
    }
}

/// Environment shared by all sessions.
#[derive(Debug)]
pub struct TxEnv {
    clock: Arc<EpochClock>,
    storages: Arc<StorageRegistry>,
    spin_retry_limit: usize,
    next_ltx_id: AtomicU64,
    ltx_begin: Mutex<()>,
}

impl TxEnv {
    /// Environment over an existing clock and registry.
    pub fn new(clock: Arc<EpochClock>, storages: Arc<StorageRegistry>, spin_retry_limit: usize) -> Self {
        TxEnv {
            clock,
            storages,
            spin_retry_limit,
            next_ltx_id: AtomicU64::new(1),
            ltx_begin: Mutex::new(()),
        }
    }

    /// Global epoch clock.
    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Shared handle to the clock.
    pub fn clock_handle(&self) -> Arc<EpochClock> {
        Arc::clone(&self.clock)
    }

    /// Storage registry.
    pub fn storages(&self) -> &StorageRegistry {
        &self.storages
    }

    /// Look up a storage.
    pub fn storage(&self, id: StorageId) -> Result<Arc<Storage>> {
        self.storages.get(id)
    }

    /// Busy-wait budget.
    pub fn spins(&self) -> usize {
        self.spin_retry_limit
    }

    /// Next long transaction priority id; lower ids win.
    pub(crate) fn next_ltx_id(&self) -> LtxId {
        LtxId(self.next_ltx_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Serializes long transaction begins so valid epochs follow id order.
    pub(crate) fn ltx_begin_guard(&self) -> MutexGuard<'_, ()> {
        self.ltx_begin.lock()
    }
}
