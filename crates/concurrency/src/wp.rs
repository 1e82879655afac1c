//! Write-preserve checks
//!
//! Short transactions consult reservations to stay out of storages a long
//! transaction has claimed. Long transactions use them for three things:
//! reserving at begin, forwarding (learning which higher-priority long
//! transactions they must commit after), and the read plan.

use std::sync::Arc;

use epochkv_core::{AbortReason, Epoch, KeyRange, Result, ResultInfo, StorageId};
use epochkv_storage::{LongTxState, Storage};
use tracing::trace;

use crate::env::TxEnv;
use crate::transaction::{ReadArea, TxContext};

/// Abort a short transaction operating at `epoch` on a reserved storage.
pub(crate) fn verify_short(ctx: &mut TxContext, storage: &Storage, epoch: Epoch) -> Result<()> {
    match storage.wp().conflicting(epoch) {
        Some(ltx) => {
            trace!(target: "epochkv::txn", storage = %storage.id(), %ltx, "write-preserved storage");
            Err(ctx.conflict(ResultInfo::new(AbortReason::OccWritePreserve).in_storage(storage.id())))
        }
        None => Ok(()),
    }
}

/// Reserve every storage for `state`. On failure every reservation made so
/// far is rolled back.
pub(crate) fn reserve(storages: &[Arc<Storage>], state: &Arc<LongTxState>) -> Result<()> {
    for (done, storage) in storages.iter().enumerate() {
        if let Err(e) = storage.wp().register(state) {
            release(&storages[..done], state);
            return Err(e);
        }
    }
    Ok(())
}

/// Drop the reservations of `state`.
pub(crate) fn release(storages: &[Arc<Storage>], state: &LongTxState) {
    for storage in storages {
        storage.wp().unregister(state.id());
    }
}

/// Publish the read plan of a long transaction.
pub(crate) fn declare_read_area(env: &TxEnv, state: &LongTxState, area: &ReadArea) -> Result<()> {
    for id in area.positive.iter().chain(area.negative.iter()) {
        env.storage(*id)?;
    }
    for id in &area.positive {
        env.storage(*id)?.wp().allow_read(state.id());
    }
    for id in &area.negative {
        env.storage(*id)?.wp().forbid_read(state.id());
    }
    Ok(())
}

/// Withdraw the read plan of a long transaction. Storages deleted in the
/// meantime are skipped.
pub(crate) fn withdraw_read_area(env: &TxEnv, state: &LongTxState, area: &ReadArea) {
    for id in area.positive.iter().chain(area.negative.iter()) {
        if let Ok(storage) = env.storage(*id) {
            storage.wp().clear_read_plan(state.id());
        }
    }
}

/// Abort a long transaction reading outside its declared area.
pub(crate) fn check_read_area(ctx: &mut TxContext, storage: &Storage) -> Result<()> {
    let permitted = match ctx.ltx.as_ref() {
        Some(ltx) => storage
            .wp()
            .permits_read(ltx.state.id(), ltx.read_area.is_restricted()),
        None => true,
    };
    if permitted {
        Ok(())
    } else {
        Err(ctx.conflict(ResultInfo::new(AbortReason::ReadAreaViolation).in_storage(storage.id())))
    }
}

/// Record forwarding dependencies of a long transaction touching `storage`.
///
/// Every higher-priority long transaction still reserving the storage, and
/// every one that already committed there with writes at or after our valid
/// epoch, becomes a dependency. Reads pass the range they cover so the
/// commit can check it against what the dependency actually wrote.
pub(crate) fn forward(ctx: &mut TxContext, storage: &Storage, range: Option<&KeyRange>) {
    let valid = ctx.valid_epoch;
    let Some(ltx) = ctx.ltx.as_mut() else {
        return;
    };
    let me = ltx.state.id();
    let sid: StorageId = storage.id();
    for reservation in storage.wp().reservations() {
        if reservation.ltx.id() < me && !reservation.ltx.is_concluded() {
            ltx.add_dep(&reservation.ltx, sid, range);
        }
    }
    for outcome in storage.wp().committed_before(me, valid) {
        ltx.add_dep(&outcome.ltx, sid, range);
    }
}
