//! Long transactions
//!
//! A long transaction reserves (write-preserves) the storages it will write
//! when it begins and gets a valid epoch one past the current epoch. It
//! reads the snapshot below that epoch and writes with timestamps inside
//! it, so its writes serialize after everything it read.
//!
//! Operations issued before every short transaction still working in an
//! older epoch has left its API call return `Premature`. That keeps a short
//! transaction from committing below the valid epoch into a storage this
//! transaction already reserved.
//!
//! Ordering among long transactions uses priority ids (lower begins
//! earlier and wins). Touching a storage a higher-priority transaction
//! reserved, or wrote at or after our valid epoch, records a forwarding
//! dependency; commit waits (returns `WaitingForOtherTx`) until every
//! dependency concluded, then aborts if one of them wrote into a range this
//! transaction read.

use std::collections::BTreeMap;
use std::sync::Arc;

use epochkv_core::{
    AbortReason, Error, KeyRange, Result, ResultInfo, StorageId, TidWord, TxKind,
};
use epochkv_storage::{LongTxState, LtxOutcome, Record, Storage, WpOutcome};
use tracing::{debug, error};

use crate::env::TxEnv;
use crate::session::Session;
use crate::transaction::{
    CommitStatus, InsertClaim, LocalView, LtxContext, TxContext, TxOptions, TxState, WriteEntry, WriteOp,
};
use crate::wp;

/// Begin a long transaction on `session`.
pub(crate) fn begin(env: &TxEnv, session: &Session, options: &TxOptions) -> Result<TxContext> {
    let storages: Vec<Arc<Storage>> = options
        .write_preserve()
        .iter()
        .map(|id| env.storage(*id))
        .collect::<Result<_>>()?;

    let mut read_area = options.read_area().clone();
    if read_area.is_restricted() {
        read_area.positive.extend_from_slice(options.write_preserve());
        read_area.positive.sort_unstable();
        read_area.positive.dedup();
    }

    let _begin = env.ltx_begin_guard();
    let id = env.next_ltx_id();
    let (state, begin_epoch) = loop {
        let begin_epoch = env.clock().current();
        let valid = begin_epoch + 1;
        session.publish_long(valid);
        let state = Arc::new(LongTxState::new(id, valid));
        if let Err(e) = wp::reserve(&storages, &state) {
            session.publish_idle();
            return Err(e);
        }
        // an epoch tick between reading the clock and reserving could let a
        // short transaction commit into the reserved storages at `valid`
        if env.clock().current() < valid {
            break (state, begin_epoch);
        }
        wp::release(&storages, &state);
    };

    if let Err(e) = wp::declare_read_area(env, &state, &read_area) {
        wp::withdraw_read_area(env, &state, &read_area);
        wp::release(&storages, &state);
        session.publish_idle();
        return Err(e);
    }

    debug!(
        target: "epochkv::ltx",
        ltx = %id,
        valid_epoch = state.valid_epoch(),
        storages = storages.len(),
        "long transaction begun"
    );
    Ok(TxContext::long(
        LtxContext {
            state,
            write_preserve: options.write_preserve().to_vec(),
            read_area,
            deps: Vec::new(),
        },
        begin_epoch,
    ))
}

/// `Premature` until no short transaction can still commit below the valid
/// epoch.
fn ensure_ready(env: &TxEnv, ctx: &TxContext) -> Result<()> {
    if env.clock().cc_safe() < ctx.valid_epoch {
        return Err(Error::Premature {
            current: env.clock().current(),
            valid: ctx.valid_epoch,
        });
    }
    Ok(())
}

/// Point read from the snapshot.
pub(crate) fn read(env: &TxEnv, ctx: &mut TxContext, storage: StorageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    ensure_ready(env, ctx)?;
    let storage = env.storage(storage)?;
    wp::check_read_area(ctx, &storage)?;
    wp::forward(ctx, &storage, Some(&KeyRange::point(key)));
    match ctx.write_set.local_view(storage.id(), key) {
        Some(LocalView::Value(v)) => return Ok(Some(v.to_vec())),
        Some(LocalView::Deleted) => return Ok(None),
        None => {}
    }
    Ok(storage
        .index()
        .get(key)
        .and_then(|record| storage.read_as_of(&record, ctx.valid_epoch)))
}

/// Records of a range, for `open_scan`. The cursor reads each one from the
/// snapshot when it gets there.
pub(crate) fn scan_records(
    env: &TxEnv,
    ctx: &mut TxContext,
    storage: &Arc<Storage>,
    range: &KeyRange,
) -> Result<Vec<Arc<Record>>> {
    ensure_ready(env, ctx)?;
    wp::check_read_area(ctx, storage)?;
    wp::forward(ctx, storage, Some(range));
    Ok(storage.index().scan(range, 0).entries)
}

/// Buffer a write into a write-preserved storage.
pub(crate) fn write(
    env: &TxEnv,
    ctx: &mut TxContext,
    storage: StorageId,
    key: &[u8],
    op: WriteOp,
    value: Option<Vec<u8>>,
) -> Result<()> {
    ensure_ready(env, ctx)?;
    let storage = env.storage(storage)?;
    let preserved = ctx.ltx.as_ref().is_some_and(|l| l.preserves(storage.id()));
    if !preserved {
        return Err(Error::WriteWithoutWritePreserve(storage.id()));
    }
    wp::forward(ctx, &storage, None);

    if let Some(entry) = ctx.write_set.get_mut(storage.id(), key) {
        let folded = entry.op.then(op)?;
        entry.op = folded;
        entry.value = if folded.writes_value() { value } else { None };
        return Ok(());
    }
    if op == WriteOp::Cancelled {
        return Err(Error::InvalidArgs("cancelled is not a write".to_string()));
    }
    ctx.write_set.insert(
        key,
        WriteEntry {
            storage,
            record: None,
            op,
            value: if op.writes_value() { value } else { None },
            claim: InsertClaim::None,
        },
    );
    Ok(())
}

/// A record resolved and locked for installation.
struct Held {
    record: Arc<Record>,
    prior: TidWord,
    fresh: bool,
}

enum Resolve {
    Locked(Held),
    Conflict(AbortReason),
    Busy,
}

/// Find or create the record for a buffered write and lock it.
///
/// A page still owned by a live inserter is waited on for the spin budget
/// and then reported as `Busy`. Aborted inserters leave a tombstone, which
/// is taken over like any other.
fn resolve_and_lock(env: &TxEnv, storage: &Storage, key: &[u8], op: WriteOp) -> Resolve {
    for _ in 0..=env.spins() {
        match storage.index().get(key) {
            Some(record) => {
                let prior = record.tid().lock();
                if record.is_unhooked() || prior.is_inserting() {
                    record.tid().unlock();
                    std::hint::spin_loop();
                    continue;
                }
                let present = !prior.is_absent();
                let reason = match op {
                    WriteOp::Insert if present => Some(AbortReason::LtxInsertExisting),
                    WriteOp::Update | WriteOp::Delete if !present => Some(AbortReason::LtxWriteToMissing),
                    _ => None,
                };
                if let Some(reason) = reason {
                    record.tid().unlock();
                    return Resolve::Conflict(reason);
                }
                return Resolve::Locked(Held {
                    record,
                    prior,
                    fresh: false,
                });
            }
            None => {
                if matches!(op, WriteOp::Update | WriteOp::Delete) {
                    return Resolve::Conflict(AbortReason::LtxWriteToMissing);
                }
                let record = Arc::new(Record::inserting(key));
                let prior = record.tid().lock();
                if storage.index().insert_if_absent(Arc::clone(&record)).is_ok() {
                    return Resolve::Locked(Held {
                        record,
                        prior,
                        fresh: true,
                    });
                }
            }
        }
    }
    Resolve::Busy
}

/// Release everything locked so far; fresh records become tombstones.
fn release_held(held: &[Held], tomb: TidWord) {
    for h in held {
        if h.fresh {
            h.record.tid().store_unlock(tomb);
        } else {
            h.record.tid().unlock();
        }
    }
}

/// Try to commit.
pub(crate) fn commit(env: &TxEnv, ctx: &mut TxContext) -> Result<CommitStatus> {
    if ctx.kind != TxKind::Long {
        return Err(Error::illegal(ctx.kind, "commit"));
    }
    ensure_ready(env, ctx)?;
    let Some(ltx) = ctx.ltx.as_ref() else {
        return Err(fatal("long transaction without long-transaction state"));
    };
    ctx.status = TxState::Committing;

    if let Some(waiting_on) = ltx.deps.iter().find(|d| !d.ltx.is_concluded()) {
        debug!(
            target: "epochkv::ltx",
            ltx = %ltx.state.id(),
            waiting_on = %waiting_on.ltx.id(),
            "commit waiting"
        );
        ctx.status = TxState::WaitingForOtherTx;
        return Ok(CommitStatus::WaitingForOtherTx);
    }

    let mut overtaken = None;
    'deps: for dep in ltx.deps.iter().filter(|d| d.ltx.outcome() == LtxOutcome::Committed) {
        for (storage, range) in &dep.ranges {
            if dep.ltx.written_in(*storage).is_some_and(|w| w.overlaps(range)) {
                overtaken = Some(ResultInfo::new(AbortReason::LtxReadUpperBound).in_storage(*storage));
                break 'deps;
            }
        }
    }
    if let Some(info) = overtaken {
        return Err(ctx.conflict(info));
    }

    let valid = ctx.valid_epoch;
    let tomb_on_failure = TidWord::new(env.clock().current(), 0)
        .with_absent(true)
        .with_latest(false);

    // phase A: resolve and lock every written record in lock order
    let mut held: Vec<Held> = Vec::with_capacity(ctx.write_set.len());
    let mut failure = None;
    for (key, entry) in ctx.write_set.iter() {
        if entry.op == WriteOp::Cancelled {
            continue;
        }
        match resolve_and_lock(env, &entry.storage, key, entry.op) {
            Resolve::Locked(h) => {
                let read_later = h.record.read_by().any_at_or_after(valid);
                held.push(h);
                if read_later {
                    failure = Some(Err(ResultInfo::new(AbortReason::LtxWriteAfterOccRead).at(entry.storage.id(), key)));
                    break;
                }
            }
            Resolve::Conflict(reason) => {
                failure = Some(Err(ResultInfo::new(reason).at(entry.storage.id(), key)));
                break;
            }
            Resolve::Busy => {
                failure = Some(Ok(Error::ConcurrentInsert(entry.storage.id())));
                break;
            }
        }
    }
    match failure {
        Some(Err(info)) => {
            release_held(&held, tomb_on_failure);
            return Err(ctx.conflict(info));
        }
        Some(Ok(busy)) => {
            release_held(&held, tomb_on_failure);
            ctx.status = TxState::Active;
            return Err(busy);
        }
        None => {}
    }

    // phase B: install
    let floor = TidWord::epoch_floor(valid);
    let mut written: BTreeMap<StorageId, KeyRange> = BTreeMap::new();
    let mut install_error = None;
    let entries = ctx.write_set.iter().filter(|(_, e)| e.op != WriteOp::Cancelled);
    for ((key, entry), h) in entries.zip(held.iter()) {
        let tid = h.prior.without_flags().max(floor).successor();
        let (tid, value) = match entry.op {
            WriteOp::Delete => (tid.with_absent(true).with_latest(false), None),
            _ => (tid.with_latest(true), entry.value.clone()),
        };
        if let Err(e) = entry.storage.install(&h.record, tid, value) {
            install_error.get_or_insert(e);
        }
        h.record.tid().store_unlock(tid);
        written
            .entry(entry.storage.id())
            .and_modify(|r| r.extend_to(key))
            .or_insert_with(|| KeyRange::point(key));
    }

    finish(env, ctx, true, written.into_iter().collect());
    match install_error {
        Some(e) => {
            error!(target: "epochkv::ltx", error = %e, "install failed after locking");
            Err(e)
        }
        None => Ok(CommitStatus::Committed),
    }
}

/// Re-poll a waiting commit.
pub(crate) fn check_commit(env: &TxEnv, ctx: &mut TxContext) -> Result<CommitStatus> {
    if ctx.kind != TxKind::Long {
        return Err(Error::illegal(ctx.kind, "check_commit"));
    }
    match ctx.status {
        TxState::WaitingForOtherTx => commit(env, ctx),
        TxState::Durable => Ok(CommitStatus::Committed),
        TxState::Aborted => Err(Error::Aborted(
            ctx.abort_info
                .as_ref()
                .map_or(AbortReason::UserAbort, |i| i.reason),
        )),
        TxState::Inactive => Err(Error::NotBegin),
        TxState::Active | TxState::Committing => Err(Error::illegal(ctx.kind, "check_commit")),
    }
}

/// Roll back.
pub(crate) fn abort(env: &TxEnv, ctx: &mut TxContext) {
    finish(env, ctx, false, Vec::new());
}

/// Publish the conclusion and drop the reservations and read plan.
fn finish(env: &TxEnv, ctx: &mut TxContext, committed: bool, written: Vec<(StorageId, KeyRange)>) {
    let Some(ltx) = ctx.ltx.as_ref() else {
        return;
    };
    let state = Arc::clone(&ltx.state);
    let preserved: Vec<Arc<Storage>> = ltx
        .write_preserve
        .iter()
        .filter_map(|id| env.storage(*id).ok())
        .collect();

    // outcome first: a dependent skipping a concluded reservation must
    // still find the transaction in the outcome log
    for storage in &preserved {
        storage.wp().record_outcome(WpOutcome {
            ltx_id: state.id(),
            committed,
            epoch: state.valid_epoch(),
            range: written
                .iter()
                .find(|(s, _)| *s == storage.id())
                .map(|(_, r)| r.clone()),
            ltx: Arc::clone(&state),
        });
    }
    state.conclude(committed, written);
    wp::release(&preserved, &state);
    wp::withdraw_read_area(env, &state, &ltx.read_area);

    ctx.status = if committed {
        TxState::Durable
    } else {
        TxState::Aborted
    };
    debug!(
        target: "epochkv::ltx",
        ltx = %state.id(),
        committed,
        "long transaction concluded"
    );
    ctx.clear();
}

fn fatal(what: &str) -> Error {
    error!(target: "epochkv::ltx", "{what}");
    Error::Fatal(what.to_string())
}
