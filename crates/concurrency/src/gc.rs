//! Garbage collector
//!
//! Three steps, all driven from outside once per epoch tick:
//!
//! 1. `compute_floors` derives the two visibility floors from the live
//!    sessions and publishes the clock's safe epochs.
//!    - `min_step`: oldest step epoch of a running short transaction.
//!    - `min_batch`: oldest valid epoch of a running long or read-only
//!      transaction, bounded by the clock's safe snapshot epoch.
//! 2. `sweep` walks every record of every storage. Tombstones older than
//!    both floors are unhooked from the index and parked in the garbage
//!    container tagged with the current epoch; other records get their
//!    version chains pruned below `min_batch`.
//! 3. `reclaim` frees parked records whose tag fell below both floors, so
//!    no reader that could have picked up the record before the unhook is
//!    still running.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use epochkv_core::{Epoch, EpochClock, StorageId, TxKind};
use epochkv_storage::{Record, Storage, StorageRegistry, StorageStats};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::session::SessionTable;

/// The two visibility floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Floors {
    /// Oldest step epoch of a running short transaction
    pub min_step: Epoch,
    /// Oldest snapshot any running long or read-only transaction may read
    pub min_batch: Epoch,
}

impl Floors {
    /// Epoch below which unhooked records may be freed.
    pub fn reclaim(&self) -> Epoch {
        self.min_step.min(self.min_batch)
    }
}

#[derive(Debug, Default)]
struct EpochFloors {
    min_step: AtomicU64,
    min_batch: AtomicU64,
}

impl EpochFloors {
    fn load(&self) -> Floors {
        Floors {
            min_step: self.min_step.load(Ordering::SeqCst),
            min_batch: self.min_batch.load(Ordering::SeqCst),
        }
    }

    fn store(&self, floors: Floors) {
        self.min_step.store(floors.min_step, Ordering::SeqCst);
        self.min_batch.store(floors.min_batch, Ordering::SeqCst);
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Tombstones unhooked from the index
    pub unhooked: usize,
    /// Versions cut from chains
    pub pruned_versions: usize,
    /// Read-by marks dropped
    pub pruned_read_marks: usize,
    /// Long transaction outcomes dropped
    pub pruned_outcomes: usize,
}

#[derive(Debug)]
struct Garbage {
    epoch: Epoch,
    storage: Arc<Storage>,
    record: Arc<Record>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    unhooked: u64,
    pruned: u64,
}

/// Epoch-based garbage collector.
#[derive(Debug, Default)]
pub struct GarbageCollector {
    floors: EpochFloors,
    sweep: Mutex<()>,
    garbage: Mutex<VecDeque<Garbage>>,
    totals: Mutex<FxHashMap<StorageId, Totals>>,
    stats: RwLock<Vec<StorageStats>>,
}

impl GarbageCollector {
    /// Collector with both floors at `epoch`.
    pub fn new(epoch: Epoch) -> Self {
        let gc = GarbageCollector::default();
        gc.floors.store(Floors {
            min_step: epoch,
            min_batch: epoch,
        });
        gc
    }

    /// Floors computed by the last `compute_floors`.
    pub fn floors(&self) -> Floors {
        self.floors.load()
    }

    /// Recompute the floors from the published session state.
    ///
    /// The first pass publishes the clock's safe epochs; the second pass
    /// runs afterwards so a read-only transaction that picked up the new
    /// safe snapshot is either seen or begins above the floor.
    pub fn compute_floors(&self, clock: &EpochClock, sessions: &SessionTable) -> Floors {
        let pre = clock.current();

        let views = sessions.views();
        let cc_safe = views
            .iter()
            .filter(|v| v.kind == Some(TxKind::Short) && v.in_call)
            .map(|v| v.step_epoch)
            .fold(pre, Epoch::min);
        let snapshot = views
            .iter()
            .filter(|v| v.kind == Some(TxKind::Long))
            .map(|v| v.valid_epoch)
            .fold(cc_safe, Epoch::min);
        clock.publish_safe(cc_safe, snapshot);

        let views = sessions.views();
        let min_step = views
            .iter()
            .filter(|v| v.kind == Some(TxKind::Short))
            .map(|v| v.step_epoch)
            .fold(pre, Epoch::min);
        let min_batch = views
            .iter()
            .filter(|v| matches!(v.kind, Some(TxKind::Long | TxKind::ReadOnly)))
            .map(|v| v.valid_epoch)
            .fold(clock.safe_snapshot(), Epoch::min);

        let floors = Floors { min_step, min_batch };
        self.floors.store(floors);
        trace!(
            target: "epochkv::gc",
            epoch = pre,
            cc_safe = clock.cc_safe(),
            safe_snapshot = clock.safe_snapshot(),
            min_step,
            min_batch,
            "floors"
        );
        floors
    }

    /// One full pass over every storage.
    pub fn sweep(&self, clock: &EpochClock, storages: &StorageRegistry) -> SweepReport {
        let _sweep = self.sweep.lock();
        let floors = self.floors();
        let tag = clock.current();
        let mut report = SweepReport::default();
        let mut stats = Vec::new();
        let mut parked = Vec::new();
        let all = storages.all();

        for storage in &all {
            let mut totals = Totals::default();
            for record in storage.index().records() {
                if try_unhook(storage, &record, floors) {
                    totals.unhooked += 1;
                    parked.push(Garbage {
                        epoch: tag,
                        storage: Arc::clone(storage),
                        record,
                    });
                    continue;
                }
                totals.pruned += storage.versions().prune(record.head(), floors.min_batch) as u64;
                report.pruned_read_marks += record.read_by().prune_below(floors.min_batch);
            }
            report.unhooked += totals.unhooked as usize;
            report.pruned_versions += totals.pruned as usize;
            report.pruned_outcomes += storage.wp().prune_outcomes(floors.min_batch);

            let mut all_totals = self.totals.lock();
            let entry = all_totals.entry(storage.id()).or_default();
            entry.unhooked += totals.unhooked;
            entry.pruned += totals.pruned;
            stats.push(storage.stats(entry.unhooked, entry.pruned));
        }

        self.totals
            .lock()
            .retain(|id, _| all.iter().any(|s| s.id() == *id));
        self.garbage.lock().extend(parked);
        *self.stats.write() = stats;

        if report.unhooked > 0 || report.pruned_versions > 0 {
            debug!(
                target: "epochkv::gc",
                unhooked = report.unhooked,
                pruned_versions = report.pruned_versions,
                pruned_outcomes = report.pruned_outcomes,
                "sweep"
            );
        }
        report
    }

    /// Free parked records whose unhook epoch fell below both floors.
    pub fn reclaim(&self) -> usize {
        let floor = self.floors().reclaim();
        let mut garbage = self.garbage.lock();
        let mut freed = 0;
        while garbage.front().is_some_and(|g| g.epoch < floor) {
            if let Some(g) = garbage.pop_front() {
                free(g);
                freed += 1;
            }
        }
        freed
    }

    /// Free everything parked, regardless of floors. Only for shutdown.
    pub fn reclaim_all(&self) -> usize {
        let mut garbage = self.garbage.lock();
        let freed = garbage.len();
        for g in garbage.drain(..) {
            free(g);
        }
        freed
    }

    /// Records parked and not yet freed.
    pub fn garbage_len(&self) -> usize {
        self.garbage.lock().len()
    }

    /// Statistics gathered by the last sweep, in storage id order.
    pub fn storage_stats(&self) -> Vec<StorageStats> {
        self.stats.read().clone()
    }
}

/// Unhook `record` if it is a tombstone below both floors that nobody is
/// inserting into and no long transaction may still need to see read.
fn try_unhook(storage: &Storage, record: &Arc<Record>, floors: Floors) -> bool {
    let floor = floors.reclaim();
    let eligible = |tid: epochkv_core::TidWord| tid.is_tombstone() && tid.epoch() < floor;

    let tid = record.tid().load();
    if tid.is_locked() || !eligible(tid) || record.is_unhooked() {
        return false;
    }
    if record.read_by().max().is_some_and(|e| e >= floors.min_batch) {
        return false;
    }
    let Some(tid) = record.tid().try_lock() else {
        return false;
    };
    if !eligible(tid) || !record.claim_unhook() {
        record.tid().unlock();
        return false;
    }
    storage.index().remove(record.key(), record);
    record.tid().unlock();
    true
}

fn free(garbage: Garbage) {
    garbage
        .storage
        .versions()
        .retire_chain(garbage.record.head());
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochkv_core::TidWord;
    use epochkv_storage::load_record;

    fn tombstone(storage: &Storage, key: &[u8], epoch: Epoch) -> Arc<Record> {
        let rec = load_record(storage, key, TidWord::new(epoch, 1), b"v").unwrap();
        rec.tid().lock();
        let tomb = TidWord::new(epoch, 2).with_absent(true).with_latest(false);
        storage.install(&rec, tomb, None).unwrap();
        rec.tid().store_unlock(tomb);
        rec
    }

    fn setup(epoch: Epoch) -> (EpochClock, SessionTable, StorageRegistry, StorageId) {
        let registry = StorageRegistry::new(4);
        let sid = registry.create(None).unwrap();
        (EpochClock::starting_at(epoch), SessionTable::new(4), registry, sid)
    }

    #[test]
    fn floors_follow_oldest_session() {
        let (clock, sessions, _, _) = setup(10);
        let a = sessions.get(sessions.enter().unwrap()).unwrap();
        let b = sessions.get(sessions.enter().unwrap()).unwrap();
        a.publish_short(7);
        b.publish_read_only(6);
        let gc = GarbageCollector::new(1);
        let floors = gc.compute_floors(&clock, &sessions);
        assert_eq!(floors.min_step, 7);
        assert_eq!(floors.min_batch, 6);
        assert_eq!(floors.reclaim(), 6);
    }

    #[test]
    fn idle_engine_floors_at_current_epoch() {
        let (clock, sessions, _, _) = setup(10);
        clock.advance();
        let gc = GarbageCollector::new(1);
        let floors = gc.compute_floors(&clock, &sessions);
        assert_eq!(floors, Floors { min_step: 11, min_batch: 11 });
        assert_eq!(clock.cc_safe(), 11);
        assert_eq!(clock.safe_snapshot(), 11);
    }

    #[test]
    fn in_call_short_transaction_holds_back_cc_safe() {
        let (clock, sessions, _, _) = setup(10);
        let s = sessions.get(sessions.enter().unwrap()).unwrap();
        s.publish_short(10);
        let _call = s.enter_call(&clock);
        clock.advance();
        let gc = GarbageCollector::new(1);
        gc.compute_floors(&clock, &sessions);
        assert_eq!(clock.cc_safe(), 10);
    }

    #[test]
    fn old_tombstone_is_unhooked_then_reclaimed() {
        let (clock, sessions, registry, sid) = setup(5);
        let storage = registry.get(sid).unwrap();
        tombstone(&storage, b"dead", 2);
        load_record(&storage, b"live", TidWord::new(2, 3), b"v").unwrap();

        let gc = GarbageCollector::new(1);
        gc.compute_floors(&clock, &sessions);
        let report = gc.sweep(&clock, &registry);
        assert_eq!(report.unhooked, 1);
        assert!(storage.index().get(b"dead").is_none());
        assert!(storage.index().get(b"live").is_some());
        assert_eq!(gc.garbage_len(), 1);

        // tagged with epoch 5; not yet below the floors
        assert_eq!(gc.reclaim(), 0);
        clock.advance();
        gc.compute_floors(&clock, &sessions);
        assert_eq!(gc.reclaim(), 1);
        assert_eq!(gc.garbage_len(), 0);
    }

    #[test]
    fn young_tombstone_and_shared_tombstone_stay() {
        let (clock, sessions, registry, sid) = setup(5);
        let storage = registry.get(sid).unwrap();
        tombstone(&storage, b"young", 5);
        let shared = tombstone(&storage, b"shared", 2);
        assert_eq!(shared.share_tombstone(), epochkv_storage::TombstoneClaim::Shared);

        let gc = GarbageCollector::new(1);
        gc.compute_floors(&clock, &sessions);
        assert_eq!(gc.sweep(&clock, &registry).unhooked, 0);
        assert_eq!(storage.index().len(), 2);
        shared.release_tombstone();
    }

    #[test]
    fn sweep_is_idempotent() {
        let (clock, sessions, registry, sid) = setup(5);
        let storage = registry.get(sid).unwrap();
        tombstone(&storage, b"a", 1);
        load_record(&storage, b"b", TidWord::new(1, 1), b"v").unwrap();

        let gc = GarbageCollector::new(1);
        gc.compute_floors(&clock, &sessions);
        gc.sweep(&clock, &registry);
        let keys_once = storage.index().len();
        let garbage_once = gc.garbage_len();
        let second = gc.sweep(&clock, &registry);
        assert_eq!(second.unhooked, 0);
        assert_eq!(storage.index().len(), keys_once);
        assert_eq!(gc.garbage_len(), garbage_once);
    }

    #[test]
    fn versions_pruned_below_min_batch() {
        let (clock, sessions, registry, sid) = setup(9);
        let storage = registry.get(sid).unwrap();
        let rec = load_record(&storage, b"k", TidWord::new(2, 1), b"a").unwrap();
        for epoch in [4, 6, 8] {
            rec.tid().lock();
            let tid = TidWord::new(epoch, 1);
            storage.install(&rec, tid, Some(vec![epoch as u8])).unwrap();
            rec.tid().store_unlock(tid);
        }
        assert_eq!(storage.versions().chain_len(rec.head()), 4);

        let reader = sessions.get(sessions.enter().unwrap()).unwrap();
        reader.publish_read_only(7);
        let gc = GarbageCollector::new(1);
        gc.compute_floors(&clock, &sessions);
        let report = gc.sweep(&clock, &registry);
        // 8 and 6 stay (6 is what the reader at 7 sees), 4 and 2 go
        assert_eq!(report.pruned_versions, 2);
        assert_eq!(storage.read_as_of(&rec, 7).as_deref(), Some(&[6u8][..]));

        let stats = gc.storage_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].pruned_versions_total, 2);
        assert_eq!(stats[0].avg_version_chain_len, 2.0);
    }

    #[test]
    fn reclaim_all_ignores_floors() {
        let (clock, sessions, registry, sid) = setup(5);
        let storage = registry.get(sid).unwrap();
        tombstone(&storage, b"a", 1);
        let gc = GarbageCollector::new(1);
        gc.compute_floors(&clock, &sessions);
        gc.sweep(&clock, &registry);
        assert_eq!(gc.reclaim_all(), 1);
        assert_eq!(gc.garbage_len(), 0);
    }
}
