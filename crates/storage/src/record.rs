//! Records
//!
//! One `Record` exists per key that is live or tombstoned in a storage. The
//! record owns the key's tid word (lock + timestamp), the head of its version
//! chain, the shared tombstone count used by racing inserters, and the set of
//! epochs at which short transactions validated a read of it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use epochkv_core::{AtomicTidWord, Epoch, TidWord};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::version::VersionHandle;

/// Result of trying to join a tombstone as an inserter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneClaim {
    /// The count was incremented; the inserter now shares the tombstone
    Shared,
    /// The garbage collector is unhooking the record; look the key up again
    Unhooking,
}

/// Epochs at which committed short transactions read the record.
///
/// Long transactions consult it at commit: a write at valid epoch `v` must
/// not land under a read that was serialized at or after `v`.
#[derive(Debug, Default)]
pub struct ReadByEpochs {
    epochs: Mutex<SmallVec<[Epoch; 4]>>,
}

impl ReadByEpochs {
    /// Note a read serialized in `epoch`.
    pub fn register(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        if let Err(pos) = epochs.binary_search(&epoch) {
            epochs.insert(pos, epoch);
        }
    }

    /// Whether any registered read happened at or after `epoch`.
    pub fn any_at_or_after(&self, epoch: Epoch) -> bool {
        self.epochs.lock().last().is_some_and(|&e| e >= epoch)
    }

    /// Newest registered read epoch.
    pub fn max(&self) -> Option<Epoch> {
        self.epochs.lock().last().copied()
    }

    /// Drop every epoch below `floor`. Returns how many were dropped.
    pub fn prune_below(&self, floor: Epoch) -> usize {
        let mut epochs = self.epochs.lock();
        let keep_from = epochs.partition_point(|&e| e < floor);
        epochs.drain(..keep_from);
        keep_from
    }

    /// Number of registered epochs.
    pub fn len(&self) -> usize {
        self.epochs.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-key record.
#[derive(Debug)]
pub struct Record {
    key: Vec<u8>,
    tid: AtomicTidWord,
    head: AtomicU64,
    tombstone_sharers: AtomicU32,
    read_by: ReadByEpochs,
}

impl Record {
    const UNHOOK_CLAIM: u32 = u32::MAX;

    /// A record owned by an inserter that has not committed yet.
    pub fn inserting(key: &[u8]) -> Self {
        Record {
            key: key.to_vec(),
            tid: AtomicTidWord::new(TidWord::inserting()),
            head: AtomicU64::new(VersionHandle::pack(None)),
            tombstone_sharers: AtomicU32::new(0),
            read_by: ReadByEpochs::default(),
        }
    }

    /// A committed record whose head is `head`.
    pub fn committed(key: &[u8], tid: TidWord, head: VersionHandle) -> Self {
        Record {
            key: key.to_vec(),
            tid: AtomicTidWord::new(tid),
            head: AtomicU64::new(VersionHandle::pack(Some(head))),
            tombstone_sharers: AtomicU32::new(0),
            read_by: ReadByEpochs::default(),
        }
    }

    /// Key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The tid cell (lock and timestamp).
    pub fn tid(&self) -> &AtomicTidWord {
        &self.tid
    }

    /// Newest version, if any has been committed.
    pub fn head(&self) -> Option<VersionHandle> {
        VersionHandle::unpack(self.head.load(Ordering::Acquire))
    }

    /// Replace the chain head. Caller holds the record lock.
    pub fn set_head(&self, head: Option<VersionHandle>) {
        self.head.store(VersionHandle::pack(head), Ordering::Release);
    }

    /// Read-by epochs.
    pub fn read_by(&self) -> &ReadByEpochs {
        &self.read_by
    }

    /// Number of inserters currently sharing the tombstone.
    pub fn tombstone_sharers(&self) -> u32 {
        match self.tombstone_sharers.load(Ordering::Acquire) {
            Self::UNHOOK_CLAIM => 0,
            n => n,
        }
    }

    /// Join the tombstone as an inserter.
    pub fn share_tombstone(&self) -> TombstoneClaim {
        let mut current = self.tombstone_sharers.load(Ordering::Acquire);
        loop {
            if current == Self::UNHOOK_CLAIM {
                return TombstoneClaim::Unhooking;
            }
            match self.tombstone_sharers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return TombstoneClaim::Shared,
                Err(seen) => current = seen,
            }
        }
    }

    /// Leave the tombstone after commit or abort of a sharing inserter.
    pub fn release_tombstone(&self) {
        let prev = self.tombstone_sharers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0 && prev != Self::UNHOOK_CLAIM);
    }

    /// Claim the record for unhooking. Succeeds only when no inserter shares
    /// the tombstone; inserters arriving afterwards see
    /// [`TombstoneClaim::Unhooking`].
    pub fn claim_unhook(&self) -> bool {
        self.tombstone_sharers
            .compare_exchange(0, Self::UNHOOK_CLAIM, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give back an unhook claim that was not carried through.
    pub fn release_unhook(&self) {
        let _ = self.tombstone_sharers.compare_exchange(
            Self::UNHOOK_CLAIM,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the record was claimed by the garbage collector.
    pub fn is_unhooked(&self) -> bool {
        self.tombstone_sharers.load(Ordering::Acquire) == Self::UNHOOK_CLAIM
    }
}
