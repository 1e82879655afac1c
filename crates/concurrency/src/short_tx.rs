//! Short (optimistic) transactions
//!
//! Reads go straight to the newest committed version and are validated at
//! commit; writes are buffered. Commit follows the usual OCC sequence:
//!
//! ```text
//! 1. lock every written record in (storage, key) order
//! 2. fence, then read the commit epoch
//! 3. validate reads, write-preserve reservations and gap stamps
//! 4. pick the commit tid
//! 5. install values and tombstones, publishing the tid as the unlock
//! 6. mark read records as read in the commit epoch
//! ```
//!
//! Inserts race other inserters of the same key. A missing key gets a fresh
//! "inserting" record owned by this transaction; a tombstoned key is
//! shared through the record's tombstone counter so the garbage collector
//! cannot unhook it underneath.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use epochkv_core::{
    AbortReason, Error, KeyRange, Result, ResultInfo, StorageId, TidWord,
};
use epochkv_storage::{LatestRead, Lookup, Record, Storage, TombstoneClaim};
use tracing::{debug, error};

use crate::env::TxEnv;
use crate::transaction::{
    InsertClaim, LocalView, ReadEntry, TxContext, TxState, WriteEntry, WriteOp,
};
use crate::validation::{self, OwnLocks};
use crate::wp;

/// Point read. `Ok(None)` means the key is absent for this transaction.
pub(crate) fn read(env: &TxEnv, ctx: &mut TxContext, storage: StorageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let storage = env.storage(storage)?;
    let step = ctx.step_epoch;
    wp::verify_short(ctx, &storage, step)?;
    match ctx.write_set.local_view(storage.id(), key) {
        Some(LocalView::Value(v)) => return Ok(Some(v.to_vec())),
        Some(LocalView::Deleted) => return Ok(None),
        None => {}
    }
    match storage.index().lookup(key) {
        Lookup::Missing(node) => {
            ctx.node_set.push(node);
            ctx.observe_index(&storage);
            Ok(None)
        }
        Lookup::Found(record) => observe(env, ctx, &storage, record),
    }
}

/// Read the newest version of `record` and register it in the read set.
pub(crate) fn observe(env: &TxEnv, ctx: &mut TxContext, storage: &Arc<Storage>, record: Arc<Record>) -> Result<Option<Vec<u8>>> {
    let read = storage.read_latest(&record, env.spins())?;
    ctx.read_set.push(ReadEntry {
        storage: Arc::clone(storage),
        record,
        tid: read.tid(),
    });
    Ok(match read {
        LatestRead::Present { value, .. } => Some(value),
        LatestRead::Absent { .. } => None,
    })
}

/// Records of a range, for `open_scan`. The gap stamps join the node set;
/// visibility is decided record by record as the cursor reaches them.
pub(crate) fn scan_records(ctx: &mut TxContext, storage: &Arc<Storage>, range: &KeyRange) -> Result<Vec<Arc<Record>>> {
    let step = ctx.step_epoch;
    wp::verify_short(ctx, storage, step)?;
    let scanned = storage.index().scan(range, 0);
    ctx.node_set.extend(scanned.nodes);
    ctx.observe_index(storage);
    Ok(scanned.entries)
}

/// Buffer a write.
pub(crate) fn write(
    env: &TxEnv,
    ctx: &mut TxContext,
    storage: StorageId,
    key: &[u8],
    op: WriteOp,
    value: Option<Vec<u8>>,
) -> Result<()> {
    let storage = env.storage(storage)?;
    let step = ctx.step_epoch;
    wp::verify_short(ctx, &storage, step)?;

    if let Some(entry) = ctx.write_set.get_mut(storage.id(), key) {
        let folded = entry.op.then(op)?;
        entry.op = folded;
        entry.value = if folded.writes_value() { value } else { None };
        return Ok(());
    }

    match op {
        WriteOp::Insert => insert(env, ctx, &storage, key, value),
        WriteOp::Upsert => match storage.index().get(key) {
            Some(record) if !record.tid().load().is_absent() => {
                buffer(ctx, &storage, key, record, WriteOp::Upsert, value, InsertClaim::None);
                Ok(())
            }
            _ => insert(env, ctx, &storage, key, value),
        },
        WriteOp::Update | WriteOp::Delete => match storage.index().lookup(key) {
            Lookup::Missing(node) => {
                ctx.node_set.push(node);
                ctx.observe_index(&storage);
                Err(Error::NotFound)
            }
            Lookup::Found(record) => {
                let Some(tid) = record.tid().load_unlocked(env.spins()) else {
                    return Err(Error::ConcurrentUpdate(storage.id()));
                };
                if tid.is_absent() {
                    ctx.read_set.push(ReadEntry {
                        storage: Arc::clone(&storage),
                        record,
                        tid,
                    });
                    return Err(Error::NotFound);
                }
                let value = if op == WriteOp::Update { value } else { None };
                buffer(ctx, &storage, key, record, op, value, InsertClaim::None);
                Ok(())
            }
        },
        WriteOp::Cancelled => Err(Error::InvalidArgs("cancelled is not a write".to_string())),
    }
}

fn buffer(
    ctx: &mut TxContext,
    storage: &Arc<Storage>,
    key: &[u8],
    record: Arc<Record>,
    op: WriteOp,
    value: Option<Vec<u8>>,
    claim: InsertClaim,
) {
    ctx.write_set.insert(
        key,
        WriteEntry {
            storage: Arc::clone(storage),
            record: Some(record),
            op,
            value,
            claim,
        },
    );
}

/// Claim the key for an insert and buffer it.
fn insert(env: &TxEnv, ctx: &mut TxContext, storage: &Arc<Storage>, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
    let spins = env.spins();
    for _ in 0..=spins {
        match storage.index().lookup(key) {
            Lookup::Missing(_) => {
                let record = Arc::new(Record::inserting(key));
                match storage.index().insert_if_absent(Arc::clone(&record)) {
                    Ok(change) => {
                        for node in ctx.node_set.iter_mut() {
                            node.absorb(&change);
                        }
                        buffer(ctx, storage, key, record, WriteOp::Insert, value, InsertClaim::FreshPage);
                        return Ok(());
                    }
                    Err(_) => continue,
                }
            }
            Lookup::Found(record) => {
                let Some(tid) = record.tid().load_unlocked(spins) else {
                    return Err(Error::ConcurrentUpdate(storage.id()));
                };
                if tid.is_inserting() {
                    std::hint::spin_loop();
                    continue;
                }
                if !tid.is_absent() {
                    ctx.read_set.push(ReadEntry {
                        storage: Arc::clone(storage),
                        record,
                        tid,
                    });
                    return Err(Error::AlreadyExists);
                }
                match record.share_tombstone() {
                    TombstoneClaim::Unhooking => {
                        std::hint::spin_loop();
                        continue;
                    }
                    TombstoneClaim::Shared => {
                        if !record.tid().load().same_version(tid) {
                            record.release_tombstone();
                            continue;
                        }
                        buffer(ctx, storage, key, record, WriteOp::Insert, value, InsertClaim::SharedTombstone);
                        return Ok(());
                    }
                }
            }
        }
    }
    Err(Error::ConcurrentInsert(storage.id()))
}

/// Commit. On a conflict every lock is released, the abort reason is left
/// in the context and `Err(Aborted)` is returned for the dispatcher to roll
/// back.
pub(crate) fn commit(env: &TxEnv, ctx: &mut TxContext, last_commit_tid: &mut TidWord) -> Result<()> {
    ctx.status = TxState::Committing;

    let mut own = OwnLocks::default();
    let mut locked: Vec<Arc<Record>> = Vec::with_capacity(ctx.write_set.len());
    let mut max_tid = last_commit_tid.without_flags();

    let mut failure: Option<ResultInfo> = None;
    for (key, entry) in ctx.write_set.iter() {
        if entry.op == WriteOp::Cancelled {
            continue;
        }
        let Some(record) = entry.record.as_ref() else {
            unlock_all(&locked);
            return Err(fatal("write-set entry without record"));
        };
        let tid = record.tid().lock();
        own.insert(record);
        locked.push(Arc::clone(record));
        max_tid = max_tid.max(tid.without_flags());

        let reason = match (entry.op, entry.claim) {
            (WriteOp::Insert | WriteOp::Upsert, InsertClaim::FreshPage) => {
                (!tid.is_inserting()).then_some(AbortReason::OccInsertExisting)
            }
            (WriteOp::Insert | WriteOp::Upsert, InsertClaim::SharedTombstone) | (WriteOp::Insert, InsertClaim::None) => {
                (!tid.is_tombstone() || record.is_unhooked()).then_some(AbortReason::OccInsertExisting)
            }
            (WriteOp::Upsert, InsertClaim::None) => record.is_unhooked().then_some(AbortReason::OccWriteToDeleted),
            (WriteOp::Update | WriteOp::Delete, _) => {
                (tid.is_absent() || record.is_unhooked()).then_some(AbortReason::OccWriteToDeleted)
            }
            (WriteOp::Cancelled, _) => None,
        };
        if let Some(reason) = reason {
            failure = Some(ResultInfo::new(reason).at(entry.storage.id(), key));
            break;
        }
    }
    if let Some(info) = failure {
        unlock_all(&locked);
        return Err(ctx.conflict(info));
    }

    fence(Ordering::SeqCst);
    let commit_epoch = env.clock().current();

    let mut result = validation::validate_read_set(&ctx.read_set, &own);
    result.merge(validation::validate_write_preserve(
        ctx.read_set
            .iter()
            .map(|r| &r.storage)
            .chain(ctx.write_set.iter().map(|(_, e)| &e.storage))
            .chain(ctx.index_storages.iter()),
        commit_epoch,
    ));
    result.merge(validation::validate_node_set(&ctx.node_set));
    if let Some(info) = result.first_info() {
        unlock_all(&locked);
        return Err(ctx.conflict(info));
    }

    for read in &ctx.read_set {
        max_tid = max_tid.max(read.tid.without_flags());
    }
    let tid = max_tid.max(TidWord::epoch_floor(commit_epoch)).successor();
    let live = tid.with_latest(true);
    let tomb = tid.with_absent(true).with_latest(false);

    let mut install_error = None;
    for (_, entry) in ctx.write_set.iter() {
        let Some(record) = entry.record.as_ref() else {
            continue;
        };
        match entry.op {
            WriteOp::Insert | WriteOp::Update | WriteOp::Upsert => {
                if let Err(e) = entry.storage.install(record, live, entry.value.clone()) {
                    install_error.get_or_insert(e);
                }
                record.tid().store_unlock(live);
            }
            WriteOp::Delete => {
                if let Err(e) = entry.storage.install(record, tomb, None) {
                    install_error.get_or_insert(e);
                }
                record.tid().store_unlock(tomb);
            }
            WriteOp::Cancelled => {
                if entry.claim == InsertClaim::FreshPage {
                    bury_fresh(record, tomb);
                }
            }
        }
        if entry.claim == InsertClaim::SharedTombstone {
            record.release_tombstone();
        }
    }

    for read in &ctx.read_set {
        read.record.read_by().register(tid.epoch());
    }
    *last_commit_tid = tid;
    ctx.status = TxState::Durable;
    debug!(
        target: "epochkv::txn",
        epoch = tid.epoch(),
        reads = ctx.read_set.len(),
        writes = ctx.write_set.len(),
        "short transaction committed"
    );
    ctx.clear();
    match install_error {
        Some(e) => {
            error!(target: "epochkv::txn", error = %e, "install failed after validation");
            Err(e)
        }
        None => Ok(()),
    }
}

/// Roll back: fresh pages become tombstones, shared tombstones are released.
pub(crate) fn abort(env: &TxEnv, ctx: &mut TxContext) {
    let tomb = TidWord::new(env.clock().current(), 0)
        .with_absent(true)
        .with_latest(false);
    for (_, entry) in ctx.write_set.drain() {
        let Some(record) = entry.record else {
            continue;
        };
        match entry.claim {
            InsertClaim::FreshPage => bury_fresh(&record, tomb),
            InsertClaim::SharedTombstone => record.release_tombstone(),
            InsertClaim::None => {}
        }
    }
    ctx.clear();
    ctx.status = TxState::Aborted;
}

/// Turn an inserting page this transaction owns into a tombstone, unless
/// another writer already took it over.
fn bury_fresh(record: &Record, tomb: TidWord) {
    let tid = record.tid().lock();
    if tid.is_inserting() {
        record.tid().store_unlock(tomb);
    } else {
        record.tid().unlock();
    }
}

fn unlock_all(records: &[Arc<Record>]) {
    for record in records {
        record.tid().unlock();
    }
}

fn fatal(what: &str) -> Error {
    error!(target: "epochkv::txn", "{what}");
    Error::Fatal(what.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochkv_core::{EpochClock, LtxId};
    use epochkv_storage::{load_record, LongTxState, StorageRegistry};

    fn env() -> (TxEnv, StorageId) {
        let registry = Arc::new(StorageRegistry::new(4));
        let sid = registry.create(None).unwrap();
        let clock = Arc::new(EpochClock::starting_at(3));
        (TxEnv::new(clock, registry, 100), sid)
    }

    fn commit_ok(env: &TxEnv, ctx: &mut TxContext) -> TidWord {
        let mut last = TidWord::default();
        commit(env, ctx, &mut last).unwrap();
        last
    }

    #[test]
    fn insert_then_read_back_after_commit() {
        let (env, sid) = env();
        let mut t1 = TxContext::short(3);
        write(&env, &mut t1, sid, b"a", WriteOp::Insert, Some(b"1".to_vec())).unwrap();
        assert_eq!(read(&env, &mut t1, sid, b"a").unwrap().as_deref(), Some(&b"1"[..]));
        let tid = commit_ok(&env, &mut t1);
        assert_eq!(tid.epoch(), 3);

        let mut t2 = TxContext::short(3);
        assert_eq!(read(&env, &mut t2, sid, b"a").unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn uncommitted_insert_is_invisible() {
        let (env, sid) = env();
        let mut t1 = TxContext::short(3);
        write(&env, &mut t1, sid, b"a", WriteOp::Insert, Some(b"1".to_vec())).unwrap();
        let mut t2 = TxContext::short(3);
        assert_eq!(read(&env, &mut t2, sid, b"a").unwrap(), None);
    }

    #[test]
    fn stale_read_fails_validation() {
        let (env, sid) = env();
        let storage = env.storage(sid).unwrap();
        load_record(&storage, b"x", TidWord::new(1, 1), b"1").unwrap();

        let mut reader = TxContext::short(3);
        read(&env, &mut reader, sid, b"x").unwrap();
        write(&env, &mut reader, sid, b"y", WriteOp::Upsert, Some(b"r".to_vec())).unwrap();

        let mut writer = TxContext::short(3);
        write(&env, &mut writer, sid, b"x", WriteOp::Update, Some(b"2".to_vec())).unwrap();
        commit_ok(&env, &mut writer);

        let err = commit(&env, &mut reader, &mut TidWord::default()).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::OccReadVerify));
        abort(&env, &mut reader);
        assert_eq!(reader.status(), TxState::Aborted);
    }

    #[test]
    fn phantom_insert_into_read_gap() {
        let (env, sid) = env();
        let mut reader = TxContext::short(3);
        assert_eq!(read(&env, &mut reader, sid, b"k").unwrap(), None);

        let mut writer = TxContext::short(3);
        write(&env, &mut writer, sid, b"k", WriteOp::Insert, Some(b"v".to_vec())).unwrap();
        commit_ok(&env, &mut writer);

        write(&env, &mut reader, sid, b"z", WriteOp::Upsert, Some(b"z".to_vec())).unwrap();
        let err = commit(&env, &mut reader, &mut TidWord::default()).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::OccPhantom));
    }

    #[test]
    fn missed_lookup_and_empty_scan_see_reservations_at_commit() {
        let (env, sid) = env();
        let other = env.storages().create(None).unwrap();
        let reserved = env.storage(sid).unwrap();

        let mut missed = TxContext::short(3);
        assert_eq!(read(&env, &mut missed, sid, b"k").unwrap(), None);
        write(&env, &mut missed, other, b"t", WriteOp::Upsert, Some(b"1".to_vec())).unwrap();

        let mut scanned = TxContext::short(3);
        assert!(scan_records(&mut scanned, &reserved, &KeyRange::full()).unwrap().is_empty());
        write(&env, &mut scanned, other, b"u", WriteOp::Upsert, Some(b"1".to_vec())).unwrap();

        reserved
            .wp()
            .register(&Arc::new(LongTxState::new(LtxId(1), 3)))
            .unwrap();
        for ctx in [&mut missed, &mut scanned] {
            let err = commit(&env, ctx, &mut TidWord::default()).unwrap_err();
            assert_eq!(err.abort_reason(), Some(AbortReason::OccWritePreserve));
            assert_eq!(ctx.abort_info.as_ref().unwrap().storage, Some(sid));
            abort(&env, ctx);
        }
        let other = env.storage(other).unwrap();
        assert!(other.index().records().iter().all(|r| r.tid().load().is_absent()));
    }

    #[test]
    fn own_insert_does_not_trip_own_gap_check() {
        let (env, sid) = env();
        let mut t = TxContext::short(3);
        assert_eq!(read(&env, &mut t, sid, b"k").unwrap(), None);
        write(&env, &mut t, sid, b"k", WriteOp::Insert, Some(b"v".to_vec())).unwrap();
        commit_ok(&env, &mut t);
    }

    #[test]
    fn insert_delete_insert_commits_final_value() {
        let (env, sid) = env();
        let mut t = TxContext::short(3);
        write(&env, &mut t, sid, b"k", WriteOp::Insert, Some(b"1".to_vec())).unwrap();
        write(&env, &mut t, sid, b"k", WriteOp::Delete, None).unwrap();
        assert_eq!(read(&env, &mut t, sid, b"k").unwrap(), None);
        write(&env, &mut t, sid, b"k", WriteOp::Insert, Some(b"2".to_vec())).unwrap();
        commit_ok(&env, &mut t);

        let mut r = TxContext::short(3);
        assert_eq!(read(&env, &mut r, sid, b"k").unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn update_missing_is_not_found_and_insert_existing_already_exists() {
        let (env, sid) = env();
        let storage = env.storage(sid).unwrap();
        load_record(&storage, b"x", TidWord::new(1, 1), b"1").unwrap();
        let mut t = TxContext::short(3);
        assert_eq!(
            write(&env, &mut t, sid, b"nope", WriteOp::Update, Some(b"v".to_vec())),
            Err(Error::NotFound)
        );
        assert_eq!(
            write(&env, &mut t, sid, b"x", WriteOp::Insert, Some(b"v".to_vec())),
            Err(Error::AlreadyExists)
        );
        assert!(t.is_active());
    }

    #[test]
    fn abort_buries_fresh_page() {
        let (env, sid) = env();
        let mut t = TxContext::short(3);
        write(&env, &mut t, sid, b"k", WriteOp::Insert, Some(b"1".to_vec())).unwrap();
        abort(&env, &mut t);
        let record = env.storage(sid).unwrap().index().get(b"k").unwrap();
        assert!(record.tid().load().is_tombstone());

        let mut t2 = TxContext::short(3);
        write(&env, &mut t2, sid, b"k", WriteOp::Insert, Some(b"2".to_vec())).unwrap();
        assert_eq!(record.tombstone_sharers(), 1);
        commit_ok(&env, &mut t2);
        assert_eq!(record.tombstone_sharers(), 0);
        assert!(!record.tid().load().is_absent());
    }

    #[test]
    fn delete_leaves_tombstone_and_keeps_old_version() {
        let (env, sid) = env();
        let storage = env.storage(sid).unwrap();
        let rec = load_record(&storage, b"x", TidWord::new(1, 1), b"1").unwrap();
        let mut t = TxContext::short(3);
        write(&env, &mut t, sid, b"x", WriteOp::Delete, None).unwrap();
        commit_ok(&env, &mut t);
        assert!(rec.tid().load().is_tombstone());
        assert_eq!(storage.read_as_of(&rec, 2).as_deref(), Some(&b"1"[..]));
        assert_eq!(storage.read_as_of(&rec, 4), None);
    }

    #[test]
    fn commit_tid_exceeds_everything_observed() {
        let (env, sid) = env();
        let storage = env.storage(sid).unwrap();
        load_record(&storage, b"x", TidWord::new(3, 40), b"1").unwrap();
        let mut t = TxContext::short(3);
        read(&env, &mut t, sid, b"x").unwrap();
        write(&env, &mut t, sid, b"y", WriteOp::Upsert, Some(b"2".to_vec())).unwrap();
        let mut last = TidWord::new(3, 7);
        commit(&env, &mut t, &mut last).unwrap();
        assert_eq!(last, TidWord::new(3, 41).without_flags());
    }
}
