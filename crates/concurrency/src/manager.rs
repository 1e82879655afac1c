//! Transaction manager
//!
//! Single entry point for every session-level operation. Each call:
//! 1. resolves the session handle and takes the session's state lock, which
//!    serializes a session's own calls against its commit and abort
//! 2. for short transactions, publishes the call's step epoch
//! 3. checks that a transaction is running and dispatches to the short,
//!    long or read-only engine by kind
//! 4. rolls the transaction back when the engine reports a conflict, and
//!    keeps the reason on the session
//!
//! ## Commit outcomes
//!
//! ```text
//! short      Committed | Err(Aborted)
//! long       Committed | WaitingForOtherTx (poll check_commit) | Err(Aborted) | Err(Premature)
//! read-only  Committed
//! ```

use std::sync::Arc;

use epochkv_core::{
    AbortReason, Epoch, EpochClock, Error, KeyRange, Result, ResultInfo, ScanEndpoint, StorageId, TxKind,
};
use epochkv_storage::{StorageRegistry, StorageStats};
use tracing::{debug, info, warn};

use crate::env::{ConcurrencyConfig, TxEnv};
use crate::gc::{Floors, GarbageCollector, SweepReport};
use crate::scan::{self, ScanHandle};
use crate::session::{Session, SessionId, SessionState, SessionTable, SessionView};
use crate::transaction::{CommitStatus, TxContext, TxOptions, TxState, WriteOp};
use crate::{long_tx, read_only_tx, short_tx};

/// Coordinates sessions, the three transaction engines and the garbage
/// collector over one clock and one storage registry.
#[derive(Debug)]
pub struct TransactionManager {
    env: TxEnv,
    sessions: SessionTable,
    gc: GarbageCollector,
}

impl TransactionManager {
    /// Manager with a fresh clock and an empty registry.
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(EpochClock::new()),
            Arc::new(StorageRegistry::new(config.max_write_preserves_per_storage)),
        )
    }

    /// Manager over an existing clock and registry.
    pub fn with_parts(config: &ConcurrencyConfig, clock: Arc<EpochClock>, storages: Arc<StorageRegistry>) -> Self {
        let gc = GarbageCollector::new(clock.current());
        TransactionManager {
            env: TxEnv::new(clock, storages, config.spin_retry_limit),
            sessions: SessionTable::new(config.max_sessions),
            gc,
        }
    }

    /// Shared environment.
    pub fn env(&self) -> &TxEnv {
        &self.env
    }

    /// Epoch clock.
    pub fn clock(&self) -> &EpochClock {
        self.env.clock()
    }

    /// Storage registry.
    pub fn storages(&self) -> &StorageRegistry {
        self.env.storages()
    }

    /// Garbage collector.
    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Claim a session slot.
    pub fn enter(&self) -> Result<SessionId> {
        let sid = self.sessions.enter()?;
        debug!(target: "epochkv::txn", session = %sid, "enter");
        Ok(sid)
    }

    /// Give a session slot back, aborting its running transaction.
    pub fn leave(&self, sid: SessionId) -> Result<()> {
        let session = self.sessions.get(sid)?;
        let mut state = session.lock();
        self.sessions.check(session, sid)?;
        let SessionState { tx, result_info, .. } = &mut *state;
        if let Some(ctx) = tx.as_mut() {
            self.rollback(session, ctx, result_info, Some(ResultInfo::new(AbortReason::Shutdown)));
        }
        *state = SessionState::default();
        self.sessions.release(session);
        debug!(target: "epochkv::txn", session = %sid, "leave");
        Ok(())
    }

    /// Published state of every occupied session.
    pub fn session_views(&self) -> Vec<SessionView> {
        self.sessions.views()
    }

    /// Number of occupied sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    /// Begin a transaction on `sid`.
    pub fn begin(&self, sid: SessionId, options: &TxOptions) -> Result<()> {
        let session = self.sessions.get(sid)?;
        let mut state = session.lock();
        self.sessions.check(session, sid)?;
        if state.tx.as_ref().is_some_and(|ctx| !ctx.is_concluded()) {
            return Err(Error::AlreadyBegin);
        }
        let kind = options.kind();
        if kind != TxKind::Long
            && (!options.write_preserve().is_empty()
                || !options.read_area().positive.is_empty()
                || !options.read_area().negative.is_empty())
        {
            return Err(Error::InvalidArgs(format!(
                "write preserve and read area apply to long transactions, not {kind}"
            )));
        }

        let ctx = match kind {
            TxKind::Short => {
                let step = self.env.clock().current();
                session.publish_short(step);
                TxContext::short(step)
            }
            TxKind::Long => long_tx::begin(&self.env, session, options)?,
            TxKind::ReadOnly => read_only_tx::begin(&self.env, session),
        };
        debug!(target: "epochkv::txn", session = %sid, %kind, "begin");
        state.tx = Some(ctx);
        state.result_info = None;
        Ok(())
    }

    /// Commit the running transaction.
    pub fn commit(&self, sid: SessionId) -> Result<CommitStatus> {
        let session = self.sessions.get(sid)?;
        let mut state = session.lock();
        self.sessions.check(session, sid)?;
        let call = session.enter_call(self.env.clock());
        let SessionState {
            tx,
            last_commit_tid,
            result_info,
        } = &mut *state;
        let ctx = tx.as_mut().ok_or(Error::NotBegin)?;
        ctx.ensure_active("commit")?;
        if call.is_some() {
            ctx.step_epoch = session.step_epoch();
        }

        let result = match ctx.kind {
            TxKind::Short => short_tx::commit(&self.env, ctx, last_commit_tid).map(|()| CommitStatus::Committed),
            TxKind::Long => long_tx::commit(&self.env, ctx),
            TxKind::ReadOnly => {
                read_only_tx::commit(ctx);
                Ok(CommitStatus::Committed)
            }
        };
        drop(call);
        self.settle(session, sid, ctx, result_info, result)
    }

    /// Poll a long transaction whose commit returned `WaitingForOtherTx`.
    pub fn check_commit(&self, sid: SessionId) -> Result<CommitStatus> {
        let session = self.sessions.get(sid)?;
        let mut state = session.lock();
        self.sessions.check(session, sid)?;
        let SessionState { tx, result_info, .. } = &mut *state;
        let ctx = tx.as_mut().ok_or(Error::NotBegin)?;
        let result = long_tx::check_commit(&self.env, ctx);
        self.settle(session, sid, ctx, result_info, result)
    }

    /// Abort the running transaction.
    pub fn abort(&self, sid: SessionId) -> Result<()> {
        let session = self.sessions.get(sid)?;
        let mut state = session.lock();
        self.sessions.check(session, sid)?;
        let SessionState { tx, result_info, .. } = &mut *state;
        match tx.as_mut() {
            Some(ctx) if !ctx.is_concluded() => {
                self.rollback(session, ctx, result_info, Some(ResultInfo::new(AbortReason::UserAbort)));
                Ok(())
            }
            _ => Err(Error::NotBegin),
        }
    }

    /// State of the session's transaction.
    pub fn tx_state(&self, sid: SessionId) -> Result<TxState> {
        let session = self.sessions.get(sid)?;
        let state = session.lock();
        self.sessions.check(session, sid)?;
        Ok(state.tx.as_ref().map_or(TxState::Inactive, TxContext::status))
    }

    /// Kind of the session's current (or last) transaction.
    pub fn tx_kind(&self, sid: SessionId) -> Result<Option<TxKind>> {
        let session = self.sessions.get(sid)?;
        let state = session.lock();
        self.sessions.check(session, sid)?;
        Ok(state.tx.as_ref().map(TxContext::kind))
    }

    /// Why the session's last transaction aborted, if it did.
    pub fn result_info(&self, sid: SessionId) -> Result<Option<ResultInfo>> {
        let session = self.sessions.get(sid)?;
        let state = session.lock();
        self.sessions.check(session, sid)?;
        Ok(state.result_info.clone())
    }

    // ========================================================================
    // Point operations
    // ========================================================================

    /// Value of `key`; `NotFound` when absent.
    pub fn search_key(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<Vec<u8>> {
        self.with_tx(sid, "search_key", |env, ctx| read(env, ctx, storage, key)?.ok_or(Error::NotFound))
    }

    /// Whether `key` exists.
    pub fn exist_key(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<bool> {
        self.with_tx(sid, "exist_key", |env, ctx| Ok(read(env, ctx, storage, key)?.is_some()))
    }

    /// Insert `key`; `AlreadyExists` if it is present.
    pub fn insert(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tx(sid, "insert", |env, ctx| {
            write(env, ctx, storage, key, WriteOp::Insert, Some(value.to_vec()))
        })
    }

    /// Overwrite `key`; `NotFound` if it is absent.
    pub fn update(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tx(sid, "update", |env, ctx| {
            write(env, ctx, storage, key, WriteOp::Update, Some(value.to_vec()))
        })
    }

    /// Insert or overwrite `key`.
    pub fn upsert(&self, sid: SessionId, storage: StorageId, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tx(sid, "upsert", |env, ctx| {
            write(env, ctx, storage, key, WriteOp::Upsert, Some(value.to_vec()))
        })
    }

    /// Delete `key`; `NotFound` if it is absent.
    pub fn delete_record(&self, sid: SessionId, storage: StorageId, key: &[u8]) -> Result<()> {
        self.with_tx(sid, "delete_record", |env, ctx| {
            write(env, ctx, storage, key, WriteOp::Delete, None)
        })
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// Open a scan over `[lower, upper]` with the given endpoint kinds,
    /// returning at most `max` entries (`0` for no limit).
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
        let range = KeyRange::from_scan(lower, lower_endpoint, upper, upper_endpoint);
        self.with_tx(sid, "open_scan", |env, ctx| scan::open_scan(env, ctx, storage, range, max))
    }

    /// Move the cursor; `ScanLimit` once past the last entry.
    pub fn next_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<()> {
        self.with_tx(sid, "next_scan", |env, ctx| scan::next_scan(env, ctx, handle))
    }

    /// Key under the cursor.
    pub fn read_key_from_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<Vec<u8>> {
        self.with_tx(sid, "read_key_from_scan", |_, ctx| {
            ctx.scans.get(handle)?.key().map(<[u8]>::to_vec)
        })
    }

    /// Value under the cursor.
    pub fn read_value_from_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<Vec<u8>> {
        self.with_tx(sid, "read_value_from_scan", |_, ctx| {
            ctx.scans.get(handle)?.value().map(<[u8]>::to_vec)
        })
    }

    /// Close a scan.
    pub fn close_scan(&self, sid: SessionId, handle: ScanHandle) -> Result<()> {
        self.with_tx(sid, "close_scan", |_, ctx| ctx.scans.close(handle))
    }

    /// Number of positions the scan cached at open, visible or not.
    pub fn scannable_total_index_size(&self, sid: SessionId, handle: ScanHandle) -> Result<usize> {
        self.with_tx(sid, "scannable_total_index_size", |_, ctx| {
            Ok(ctx.scans.get(handle)?.len())
        })
    }

    // ========================================================================
    // Storage administration
    // ========================================================================

    /// Create a storage, allocating an id when none is given.
    pub fn create_storage(&self, id: Option<StorageId>) -> Result<StorageId> {
        self.env.storages().create(id)
    }

    /// Create a storage under a caller-chosen id.
    pub fn register_storage(&self, id: StorageId) -> Result<()> {
        self.env.storages().register(id)
    }

    /// Drop a storage and its records.
    pub fn delete_storage(&self, id: StorageId) -> Result<()> {
        self.env.storages().delete(id).map(|_| ())
    }

    /// Whether the storage exists.
    pub fn exist_storage(&self, id: StorageId) -> bool {
        self.env.storages().exists(id)
    }

    /// Every storage id, ascending.
    pub fn list_storage(&self) -> Vec<StorageId> {
        self.env.storages().list()
    }

    // ========================================================================
    // Epochs and garbage collection
    // ========================================================================

    /// Tick the clock and recompute the floors. Returns the new epoch.
    pub fn advance_epoch(&self) -> Epoch {
        let epoch = self.env.clock().advance();
        self.compute_floors();
        epoch
    }

    /// Recompute the floors and publish the clock's safe epochs.
    pub fn compute_floors(&self) -> Floors {
        self.gc.compute_floors(self.env.clock(), &self.sessions)
    }

    /// One sweep followed by a reclaim pass.
    pub fn collect_garbage(&self) -> (SweepReport, usize) {
        let report = self.gc.sweep(self.env.clock(), self.env.storages());
        let freed = self.gc.reclaim();
        (report, freed)
    }

    /// Statistics gathered by the last sweep.
    pub fn storage_stats(&self) -> Vec<StorageStats> {
        self.gc.storage_stats()
    }

    /// Abort every running transaction and free all parked garbage.
    pub fn shutdown(&self) {
        let mut aborted = 0;
        for session in self.sessions.occupied() {
            let mut state = session.lock();
            let SessionState { tx, result_info, .. } = &mut *state;
            if let Some(ctx) = tx.as_mut() {
                if !ctx.is_concluded() {
                    self.rollback(session, ctx, result_info, Some(ResultInfo::new(AbortReason::Shutdown)));
                    aborted += 1;
                }
            }
        }
        let freed = self.gc.reclaim_all();
        info!(target: "epochkv::txn", aborted, freed, "transaction manager shut down");
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run `op` against the session's active transaction, rolling it back
    /// when `op` reports a conflict.
    fn with_tx<T>(
        &self,
        sid: SessionId,
        name: &'static str,
        op: impl FnOnce(&TxEnv, &mut TxContext) -> Result<T>,
    ) -> Result<T> {
        let session = self.sessions.get(sid)?;
        let mut state = session.lock();
        self.sessions.check(session, sid)?;
        let call = session.enter_call(self.env.clock());
        let SessionState { tx, result_info, .. } = &mut *state;
        let ctx = tx.as_mut().ok_or(Error::NotBegin)?;
        ctx.ensure_active(name)?;
        if call.is_some() {
            ctx.step_epoch = session.step_epoch();
        }

        let result = op(&self.env, ctx);
        drop(call);
        if let Err(Error::Aborted(reason)) = &result {
            let info = ctx.abort_info.take().unwrap_or_else(|| ResultInfo::new(*reason));
            self.rollback(session, ctx, result_info, Some(info));
        }
        result
    }

    /// Bring the session in line with the outcome of a commit attempt.
    fn settle(
        &self,
        session: &Session,
        sid: SessionId,
        ctx: &mut TxContext,
        result_info: &mut Option<ResultInfo>,
        result: Result<CommitStatus>,
    ) -> Result<CommitStatus> {
        match &result {
            Ok(CommitStatus::Committed) => {
                debug!(target: "epochkv::txn", session = %sid, kind = %ctx.kind, "commit");
            }
            Ok(CommitStatus::WaitingForOtherTx) => {
                debug!(target: "epochkv::txn", session = %sid, "commit waiting for other transactions");
            }
            Err(Error::Aborted(reason)) => {
                let info = ctx.abort_info.take().unwrap_or_else(|| ResultInfo::new(*reason));
                self.rollback(session, ctx, result_info, Some(info));
            }
            Err(_) if ctx.status == TxState::Committing => {
                // the engine gave up mid-commit without a conflict
                self.rollback(session, ctx, result_info, None);
            }
            Err(_) => {}
        }
        if ctx.is_concluded() {
            session.publish_idle();
        }
        result
    }

    /// Roll the transaction back through its engine and record why.
    fn rollback(
        &self,
        session: &Session,
        ctx: &mut TxContext,
        result_info: &mut Option<ResultInfo>,
        info: Option<ResultInfo>,
    ) {
        if ctx.is_concluded() {
            return;
        }
        match ctx.kind {
            TxKind::Short => short_tx::abort(&self.env, ctx),
            TxKind::Long => long_tx::abort(&self.env, ctx),
            TxKind::ReadOnly => read_only_tx::abort(ctx),
        }
        if let Some(info) = &info {
            match info.reason {
                AbortReason::UserAbort | AbortReason::Shutdown => {
                    debug!(target: "epochkv::txn", kind = %ctx.kind, reason = %info.reason, "abort");
                }
                reason => {
                    warn!(
                        target: "epochkv::txn",
                        kind = %ctx.kind,
                        %reason,
                        storage = ?info.storage,
                        "transaction aborted"
                    );
                }
            }
        }
        ctx.abort_info = info.clone();
        *result_info = info;
        session.publish_idle();
    }
}

fn read(env: &TxEnv, ctx: &mut TxContext, storage: StorageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match ctx.kind {
        TxKind::Short => short_tx::read(env, ctx, storage, key),
        TxKind::Long => long_tx::read(env, ctx, storage, key),
        TxKind::ReadOnly => read_only_tx::read(env, ctx, storage, key),
    }
}

fn write(
    env: &TxEnv,
    ctx: &mut TxContext,
    storage: StorageId,
    key: &[u8],
    op: WriteOp,
    value: Option<Vec<u8>>,
) -> Result<()> {
    match ctx.kind {
        TxKind::Short => short_tx::write(env, ctx, storage, key, op, value),
        TxKind::Long => long_tx::write(env, ctx, storage, key, op, value),
        TxKind::ReadOnly => Err(Error::illegal(ctx.kind, op_name(op))),
    }
}

fn op_name(op: WriteOp) -> &'static str {
    match op {
        WriteOp::Insert => "insert",
        WriteOp::Update => "update",
        WriteOp::Upsert => "upsert",
        WriteOp::Delete | WriteOp::Cancelled => "delete_record",
    }
}
