//! Versioned timestamp word
//!
//! Every record carries a single 64-bit word that is both its commit
//! timestamp and its spinlock:
//!
//! ```text
//!  63            32 31                 3   2        1        0
//! +----------------+--------------------+--------+--------+------+
//! |     epoch      |      counter       | absent | latest | lock |
//! +----------------+--------------------+--------+--------+------+
//! ```
//!
//! - `lock`: held by a committer during its write-lock phase
//! - `latest`: the record is the newest incarnation of its key
//! - `absent`: the record carries no value (tombstone or inserting page)
//!
//! Timestamps order by `(epoch, counter)`; the flag bits never take part in
//! ordering. `TidWord` is the plain value, `AtomicTidWord` is the shared cell
//! living inside a record.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::epoch::Epoch;

const LOCK_BIT: u64 = 1;
const LATEST_BIT: u64 = 1 << 1;
const ABSENT_BIT: u64 = 1 << 2;
const FLAG_MASK: u64 = LOCK_BIT | LATEST_BIT | ABSENT_BIT;
const COUNTER_SHIFT: u32 = 3;
const COUNTER_BITS: u32 = 29;
const EPOCH_SHIFT: u32 = COUNTER_SHIFT + COUNTER_BITS;

/// Packed lock/latest/absent flags plus an `(epoch, counter)` timestamp.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TidWord(u64);

impl TidWord {
    /// Largest counter value representable inside one epoch.
    pub const MAX_COUNTER: u32 = (1 << COUNTER_BITS) - 1;

    /// Largest epoch representable in the word.
    pub const MAX_EPOCH: Epoch = u32::MAX as Epoch;

    /// A committed, visible timestamp (`latest`, not absent, unlocked).
    pub fn new(epoch: Epoch, counter: u32) -> Self {
        Self::compose(epoch, counter).with_latest(true)
    }

    /// The smallest timestamp inside `epoch` (counter 0, no flags).
    ///
    /// Used as a lower bound when computing commit timestamps.
    pub fn epoch_floor(epoch: Epoch) -> Self {
        Self::compose(epoch, 0)
    }

    /// Word for a freshly created record that an inserter still owns:
    /// `latest | absent`, timestamp zero.
    pub fn inserting() -> Self {
        TidWord(LATEST_BIT | ABSENT_BIT)
    }

    fn compose(epoch: Epoch, counter: u32) -> Self {
        debug_assert!(epoch <= Self::MAX_EPOCH, "epoch {epoch} overflows tid word");
        debug_assert!(counter <= Self::MAX_COUNTER, "counter {counter} overflows tid word");
        TidWord((epoch << EPOCH_SHIFT) | ((counter as u64) << COUNTER_SHIFT))
    }

    /// Rebuild from the raw 64-bit representation.
    pub const fn from_raw(raw: u64) -> Self {
        TidWord(raw)
    }

    /// Raw 64-bit representation.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Epoch part of the timestamp.
    pub fn epoch(self) -> Epoch {
        self.0 >> EPOCH_SHIFT
    }

    /// Counter part of the timestamp.
    pub fn counter(self) -> u32 {
        ((self.0 >> COUNTER_SHIFT) & Self::MAX_COUNTER as u64) as u32
    }

    /// `(epoch, counter)` packed into one orderable integer, flags stripped.
    pub fn timestamp(self) -> u64 {
        self.0 >> COUNTER_SHIFT
    }

    /// Whether the lock bit is set.
    pub fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    /// Whether the latest bit is set.
    pub fn is_latest(self) -> bool {
        self.0 & LATEST_BIT != 0
    }

    /// Whether the absent bit is set.
    pub fn is_absent(self) -> bool {
        self.0 & ABSENT_BIT != 0
    }

    /// Committed delete: absent and no longer latest.
    pub fn is_tombstone(self) -> bool {
        self.is_absent() && !self.is_latest()
    }

    /// Record created by an insert that has not committed yet.
    pub fn is_inserting(self) -> bool {
        self.is_absent() && self.is_latest()
    }

    /// Set or clear the lock bit.
    pub fn with_lock(self, locked: bool) -> Self {
        self.with_bit(LOCK_BIT, locked)
    }

    /// Set or clear the latest bit.
    pub fn with_latest(self, latest: bool) -> Self {
        self.with_bit(LATEST_BIT, latest)
    }

    /// Set or clear the absent bit.
    pub fn with_absent(self, absent: bool) -> Self {
        self.with_bit(ABSENT_BIT, absent)
    }

    fn with_bit(self, bit: u64, on: bool) -> Self {
        if on {
            TidWord(self.0 | bit)
        } else {
            TidWord(self.0 & !bit)
        }
    }

    /// Same timestamp with all flags cleared.
    pub fn without_flags(self) -> Self {
        TidWord(self.0 & !FLAG_MASK)
    }

    /// Equality ignoring the lock bit.
    ///
    /// This is the read-set validation test: a record whose lock is held
    /// by the validating transaction itself is still "unchanged".
    pub fn same_version(self, other: TidWord) -> bool {
        self.with_lock(false) == other.with_lock(false)
    }

    /// Smallest timestamp strictly greater than `self`, flags cleared.
    pub fn successor(self) -> Self {
        let counter = self.counter();
        if counter < Self::MAX_COUNTER {
            Self::compose(self.epoch(), counter + 1)
        } else {
            Self::compose(self.epoch() + 1, 0)
        }
    }
}

impl PartialOrd for TidWord {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TidWord {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then((self.0 & FLAG_MASK).cmp(&(other.0 & FLAG_MASK)))
    }
}

impl fmt::Debug for TidWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TidWord")
            .field("epoch", &self.epoch())
            .field("counter", &self.counter())
            .field("lock", &self.is_locked())
            .field("latest", &self.is_latest())
            .field("absent", &self.is_absent())
            .finish()
    }
}

/// Shared tid cell embedded in a record.
///
/// The lock bit is acquired with compare-and-swap and released by a plain
/// store of the next word, so a committer both unlocks and publishes its new
/// timestamp in one step.
#[derive(Debug, Default)]
pub struct AtomicTidWord(AtomicU64);

impl AtomicTidWord {
    /// Create a cell holding `tid`.
    pub fn new(tid: TidWord) -> Self {
        AtomicTidWord(AtomicU64::new(tid.raw()))
    }

    /// Acquire-load the current word.
    pub fn load(&self) -> TidWord {
        TidWord(self.0.load(Ordering::Acquire))
    }

    /// Load, spinning while the lock bit is held, at most `spins` times.
    ///
    /// Returns `None` when the word stayed locked for the whole budget.
    pub fn load_unlocked(&self, spins: usize) -> Option<TidWord> {
        for _ in 0..=spins {
            let tid = self.load();
            if !tid.is_locked() {
                return Some(tid);
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Single lock attempt. Returns the pre-lock word on success.
    pub fn try_lock(&self) -> Option<TidWord> {
        let current = self.load();
        if current.is_locked() {
            return None;
        }
        self.0
            .compare_exchange(
                current.raw(),
                current.with_lock(true).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(TidWord)
    }

    /// Spin until the lock bit is acquired. Returns the pre-lock word.
    ///
    /// Holders always release before returning control to their caller, so
    /// the wait is bounded by the holder's critical section.
    pub fn lock(&self) -> TidWord {
        let mut spins: u32 = 0;
        loop {
            if let Some(tid) = self.try_lock() {
                return tid;
            }
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Release the lock leaving the rest of the word unchanged.
    pub fn unlock(&self) {
        let current = self.load();
        debug_assert!(current.is_locked(), "unlock of an unlocked tid word");
        self.0.store(current.with_lock(false).raw(), Ordering::Release);
    }

    /// Publish `tid` (lock bit cleared). Caller must hold the lock.
    pub fn store_unlock(&self, tid: TidWord) {
        debug_assert!(self.load().is_locked(), "store_unlock without holding the lock");
        self.0.store(tid.with_lock(false).raw(), Ordering::Release);
    }

    /// Overwrite the word while keeping the lock held. Caller must hold the lock.
    pub fn store_locked(&self, tid: TidWord) {
        self.0.store(tid.with_lock(true).raw(), Ordering::Release);
    }
}
