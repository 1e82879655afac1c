//! Write-preserve metadata
//!
//! Each storage carries the bookkeeping long transactions coordinate
//! through:
//!
//! - a bounded array of live reservations `(valid epoch, long tx)`,
//! - an outcome log of concluded long transactions (id, committed, epoch,
//!   written key range), consulted by forwarding checks of younger long
//!   transactions and pruned by the garbage collector,
//! - the read plan: long transaction ids that declared this storage
//!   readable (positive) or forbidden (negative).
//!
//! Every part sits behind its own reader/writer lock; none of them is ever
//! taken while a record lock is held by the same thread for longer than a
//! lookup.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use epochkv_core::{Epoch, Error, KeyRange, LtxId, Result, StorageId};
use parking_lot::{Mutex, RwLock};

/// Conclusion of a long transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtxOutcome {
    /// Still running
    Active,
    /// Committed
    Committed,
    /// Aborted
    Aborted,
}

/// Shared, concluding state of one long transaction.
///
/// Reservations and forwarding dependencies hold it by `Arc`, so a waiting
/// transaction can observe the conclusion without going through the owner's
/// session.
#[derive(Debug)]
pub struct LongTxState {
    id: LtxId,
    valid_epoch: Epoch,
    outcome: AtomicU8,
    written: Mutex<Vec<(StorageId, KeyRange)>>,
}

impl LongTxState {
    const ACTIVE: u8 = 0;
    const COMMITTED: u8 = 1;
    const ABORTED: u8 = 2;

    /// State of a freshly begun long transaction.
    pub fn new(id: LtxId, valid_epoch: Epoch) -> Self {
        LongTxState {
            id,
            valid_epoch,
            outcome: AtomicU8::new(Self::ACTIVE),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Priority id.
    pub fn id(&self) -> LtxId {
        self.id
    }

    /// Valid epoch.
    pub fn valid_epoch(&self) -> Epoch {
        self.valid_epoch
    }

    /// Current outcome.
    pub fn outcome(&self) -> LtxOutcome {
        match self.outcome.load(Ordering::Acquire) {
            Self::ACTIVE => LtxOutcome::Active,
            Self::COMMITTED => LtxOutcome::Committed,
            _ => LtxOutcome::Aborted,
        }
    }

    /// Whether the transaction committed or aborted.
    pub fn is_concluded(&self) -> bool {
        self.outcome() != LtxOutcome::Active
    }

    /// Publish the conclusion. The written ranges become visible before the
    /// outcome does.
    pub fn conclude(&self, committed: bool, written: Vec<(StorageId, KeyRange)>) {
        *self.written.lock() = written;
        let outcome = if committed {
            Self::COMMITTED
        } else {
            Self::ABORTED
        };
        self.outcome.store(outcome, Ordering::Release);
    }

    /// Range written in `storage`, once committed.
    pub fn written_in(&self, storage: StorageId) -> Option<KeyRange> {
        if self.outcome() != LtxOutcome::Committed {
            return None;
        }
        self.written
            .lock()
            .iter()
            .find(|(s, _)| *s == storage)
            .map(|(_, r)| r.clone())
    }
}

/// Live reservation of a storage.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Valid epoch of the reserving transaction
    pub epoch: Epoch,
    /// The reserving transaction
    pub ltx: Arc<LongTxState>,
}

/// Concluded long transaction, as logged per storage.
#[derive(Debug, Clone)]
pub struct WpOutcome {
    /// Priority id
    pub ltx_id: LtxId,
    /// Whether it committed
    pub committed: bool,
    /// Epoch its writes carry
    pub epoch: Epoch,
    /// Keys it wrote in this storage
    pub range: Option<KeyRange>,
    /// The transaction itself, so dependents can attach to it
    pub ltx: Arc<LongTxState>,
}

#[derive(Debug, Default)]
struct ReadPlan {
    positive: BTreeSet<LtxId>,
    negative: BTreeSet<LtxId>,
}

/// Write-preserve metadata of one storage.
#[derive(Debug)]
pub struct WpMeta {
    storage: StorageId,
    capacity: usize,
    reservations: RwLock<Vec<Reservation>>,
    outcomes: RwLock<Vec<WpOutcome>>,
    read_plan: RwLock<ReadPlan>,
}

impl WpMeta {
    /// Metadata for `storage` holding at most `capacity` reservations.
    pub fn new(storage: StorageId, capacity: usize) -> Self {
        WpMeta {
            storage,
            capacity: capacity.max(1),
            reservations: RwLock::new(Vec::new()),
            outcomes: RwLock::new(Vec::new()),
            read_plan: RwLock::new(ReadPlan::default()),
        }
    }

    /// Reserve the storage for `ltx` from its valid epoch on.
    pub fn register(&self, ltx: &Arc<LongTxState>) -> Result<()> {
        let mut reservations = self.reservations.write();
        if reservations.iter().any(|r| r.ltx.id() == ltx.id()) {
            return Ok(());
        }
        if reservations.len() >= self.capacity {
            return Err(Error::WritePreserveFull(self.storage));
        }
        reservations.push(Reservation {
            epoch: ltx.valid_epoch(),
            ltx: Arc::clone(ltx),
        });
        Ok(())
    }

    /// Drop the reservation of `id`.
    pub fn unregister(&self, id: LtxId) -> bool {
        let mut reservations = self.reservations.write();
        let before = reservations.len();
        reservations.retain(|r| r.ltx.id() != id);
        reservations.len() != before
    }

    /// Snapshot of the live reservations.
    pub fn reservations(&self) -> Vec<Reservation> {
        self.reservations.read().clone()
    }

    /// Whether any reservation is live.
    pub fn has_reservations(&self) -> bool {
        !self.reservations.read().is_empty()
    }

    /// Highest-priority live reservation whose epoch is at or below `epoch`.
    /// A short transaction serialized at `epoch` conflicts with it.
    pub fn conflicting(&self, epoch: Epoch) -> Option<LtxId> {
        self.reservations
            .read()
            .iter()
            .filter(|r| r.epoch <= epoch)
            .map(|r| r.ltx.id())
            .min()
    }

    /// Append a concluded long transaction to the outcome log.
    pub fn record_outcome(&self, outcome: WpOutcome) {
        self.outcomes.write().push(outcome);
    }

    /// Committed outcomes of transactions with higher priority than `id`
    /// whose writes carry an epoch at or after `epoch`.
    pub fn committed_before(&self, id: LtxId, epoch: Epoch) -> Vec<WpOutcome> {
        self.outcomes
            .read()
            .iter()
            .filter(|o| o.committed && o.ltx_id < id && o.epoch >= epoch)
            .cloned()
            .collect()
    }

    /// Drop outcomes whose epoch is below `floor`. Returns how many went.
    pub fn prune_outcomes(&self, floor: Epoch) -> usize {
        let mut outcomes = self.outcomes.write();
        let before = outcomes.len();
        outcomes.retain(|o| o.epoch >= floor);
        before - outcomes.len()
    }

    /// Number of logged outcomes.
    pub fn outcome_count(&self) -> usize {
        self.outcomes.read().len()
    }

    /// Declare this storage readable by `id`.
    pub fn allow_read(&self, id: LtxId) {
        self.read_plan.write().positive.insert(id);
    }

    /// Declare this storage forbidden for `id`.
    pub fn forbid_read(&self, id: LtxId) {
        self.read_plan.write().negative.insert(id);
    }

    /// Forget every read-plan declaration of `id`.
    pub fn clear_read_plan(&self, id: LtxId) {
        let mut plan = self.read_plan.write();
        plan.positive.remove(&id);
        plan.negative.remove(&id);
    }

    /// Whether `id` may read this storage. `restricted` says the transaction
    /// declared a positive list somewhere, so storages outside it are closed.
    pub fn permits_read(&self, id: LtxId, restricted: bool) -> bool {
        let plan = self.read_plan.read();
        if plan.negative.contains(&id) {
            return false;
        }
        !restricted || plan.positive.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ltx(id: u64, epoch: Epoch) -> Arc<LongTxState> {
        Arc::new(LongTxState::new(LtxId(id), epoch))
    }

    #[test]
    fn reservation_array_is_bounded() {
        let wp = WpMeta::new(StorageId(1), 2);
        wp.register(&ltx(1, 5)).unwrap();
        wp.register(&ltx(2, 5)).unwrap();
        assert_eq!(
            wp.register(&ltx(3, 5)),
            Err(Error::WritePreserveFull(StorageId(1)))
        );
        assert!(wp.unregister(LtxId(1)));
        assert!(!wp.unregister(LtxId(1)));
        wp.register(&ltx(3, 5)).unwrap();
        assert_eq!(wp.reservations().len(), 2);
    }

    #[test]
    fn register_is_idempotent_per_transaction() {
        let wp = WpMeta::new(StorageId(1), 1);
        let t = ltx(1, 3);
        wp.register(&t).unwrap();
        wp.register(&t).unwrap();
        assert_eq!(wp.reservations().len(), 1);
    }

    #[test]
    fn conflicting_reports_reservations_at_or_below_epoch() {
        let wp = WpMeta::new(StorageId(1), 8);
        wp.register(&ltx(4, 10)).unwrap();
        wp.register(&ltx(2, 12)).unwrap();
        assert_eq!(wp.conflicting(9), None);
        assert_eq!(wp.conflicting(10), Some(LtxId(4)));
        assert_eq!(wp.conflicting(12), Some(LtxId(2)));
    }

    #[test]
    fn outcome_log_filter_and_prune() {
        let wp = WpMeta::new(StorageId(1), 8);
        for (id, committed, epoch) in [(1, true, 3), (2, false, 5), (3, true, 7)] {
            wp.record_outcome(WpOutcome {
                ltx_id: LtxId(id),
                committed,
                epoch,
                range: Some(KeyRange::point(b"k")),
                ltx: ltx(id, epoch),
            });
        }
        let seen: Vec<_> = wp
            .committed_before(LtxId(5), 4)
            .into_iter()
            .map(|o| o.ltx_id)
            .collect();
        assert_eq!(seen, vec![LtxId(3)]);

        assert_eq!(wp.prune_outcomes(6), 2);
        assert_eq!(wp.outcome_count(), 1);
    }

    #[test]
    fn read_plan_positive_and_negative() {
        let wp = WpMeta::new(StorageId(1), 8);
        assert!(wp.permits_read(LtxId(1), false));
        assert!(!wp.permits_read(LtxId(1), true));

        wp.allow_read(LtxId(1));
        assert!(wp.permits_read(LtxId(1), true));

        wp.forbid_read(LtxId(2));
        assert!(!wp.permits_read(LtxId(2), false));

        wp.clear_read_plan(LtxId(2));
        assert!(wp.permits_read(LtxId(2), false));
    }

    #[test]
    fn conclusion_publishes_written_ranges() {
        let t = ltx(1, 3);
        assert_eq!(t.outcome(), LtxOutcome::Active);
        assert!(t.written_in(StorageId(1)).is_none());
        t.conclude(true, vec![(StorageId(1), KeyRange::point(b"a"))]);
        assert!(t.is_concluded());
        assert_eq!(t.written_in(StorageId(1)), Some(KeyRange::point(b"a")));
        assert!(t.written_in(StorageId(2)).is_none());
    }
}
