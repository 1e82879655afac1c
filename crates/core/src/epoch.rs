//! Global epoch clock
//!
//! The epoch is the coarse logical clock every other component reads. The
//! clock itself never owns a thread: whoever drives the engine (a ticker
//! thread, or a test calling `advance`) moves it forward.
//!
//! Besides the current epoch the clock publishes two derived epochs, both
//! recomputed from the live sessions on every tick:
//!
//! - *cc-safe epoch*: no running short transaction can still commit with an
//!   epoch below it. A long transaction is premature until this reaches its
//!   valid epoch.
//! - *safe snapshot epoch*: additionally bounded by the valid epochs of
//!   running long transactions. Read-only transactions take it as their
//!   snapshot boundary, and the garbage collector folds it into its floors.

use std::sync::atomic::{AtomicU64, Ordering};

/// Epoch number.
pub type Epoch = u64;

/// First epoch handed out by a fresh clock. Epoch 0 is never current, so a
/// timestamp with epoch 0 means "never committed".
pub const INITIAL_EPOCH: Epoch = 1;

/// Monotonic global epoch plus the published safe epochs.
#[derive(Debug)]
pub struct EpochClock {
    current: AtomicU64,
    cc_safe: AtomicU64,
    safe_snapshot: AtomicU64,
}

impl EpochClock {
    /// Clock starting at [`INITIAL_EPOCH`].
    pub fn new() -> Self {
        Self::starting_at(INITIAL_EPOCH)
    }

    /// Clock starting at `epoch`.
    pub fn starting_at(epoch: Epoch) -> Self {
        let epoch = epoch.max(INITIAL_EPOCH);
        Self {
            current: AtomicU64::new(epoch),
            cc_safe: AtomicU64::new(epoch),
            safe_snapshot: AtomicU64::new(epoch),
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn current(&self) -> Epoch {
        self.current.load(Ordering::SeqCst)
    }

    /// Advance by one tick and return the new epoch.
    pub fn advance(&self) -> Epoch {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Published cc-safe epoch.
    #[inline]
    pub fn cc_safe(&self) -> Epoch {
        self.cc_safe.load(Ordering::SeqCst)
    }

    /// Published safe snapshot epoch.
    #[inline]
    pub fn safe_snapshot(&self) -> Epoch {
        self.safe_snapshot.load(Ordering::SeqCst)
    }

    /// Publish freshly computed safe epochs. Neither value moves backwards,
    /// passes the current epoch, or lets the snapshot epoch pass the cc-safe
    /// epoch.
    pub fn publish_safe(&self, cc_safe: Epoch, safe_snapshot: Epoch) {
        let current = self.current();
        let cc_safe = cc_safe.min(current);
        self.cc_safe.fetch_max(cc_safe, Ordering::SeqCst);
        let bounded = safe_snapshot.min(self.cc_safe());
        self.safe_snapshot.fetch_max(bounded, Ordering::SeqCst);
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}
