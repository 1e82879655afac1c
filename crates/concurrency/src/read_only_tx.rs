//! Read-only snapshot transactions
//!
//! A read-only transaction reads the snapshot below the clock's safe
//! snapshot epoch: no short transaction can still commit below it and no
//! running long transaction writes below it, so the snapshot never changes
//! underneath. It takes no locks, keeps no read set and never aborts on a
//! conflict.

use std::sync::Arc;

use epochkv_core::{KeyRange, Result, StorageId};
use epochkv_storage::{Record, Storage};
use tracing::debug;

use crate::env::TxEnv;
use crate::session::Session;
use crate::transaction::{LocalView, TxContext, TxState};

/// Begin a read-only transaction on `session`.
///
/// The valid epoch is published before it is trusted: the garbage
/// collector prunes against the safe snapshot it published last, so once
/// our epoch is visible and still equal to the clock's value nothing we
/// can see will be pruned.
pub(crate) fn begin(env: &TxEnv, session: &Session) -> TxContext {
    let valid = loop {
        let valid = env.clock().safe_snapshot();
        session.publish_read_only(valid);
        if env.clock().safe_snapshot() == valid {
            break valid;
        }
    };
    debug!(target: "epochkv::txn", valid_epoch = valid, "read-only transaction begun");
    TxContext::read_only(env.clock().current(), valid)
}

/// Point read from the snapshot.
pub(crate) fn read(env: &TxEnv, ctx: &TxContext, storage: StorageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let storage = env.storage(storage)?;
    if let Some(view) = ctx.write_set.local_view(storage.id(), key) {
        return Ok(match view {
            LocalView::Value(v) => Some(v.to_vec()),
            LocalView::Deleted => None,
        });
    }
    Ok(storage
        .index()
        .get(key)
        .and_then(|record| storage.read_as_of(&record, ctx.valid_epoch)))
}

/// Records of a range, for `open_scan`.
pub(crate) fn scan_records(storage: &Storage, range: &KeyRange) -> Vec<Arc<Record>> {
    storage.index().scan(range, 0).entries
}

/// Conclude; there is nothing to install.
pub(crate) fn commit(ctx: &mut TxContext) {
    ctx.clear();
    ctx.status = TxState::Durable;
}

/// Conclude without effect.
pub(crate) fn abort(ctx: &mut TxContext) {
    ctx.clear();
    ctx.status = TxState::Aborted;
}
