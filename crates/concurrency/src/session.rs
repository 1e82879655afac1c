//! Sessions
//!
//! A session is one worker's slot in the engine. It owns at most one
//! transaction at a time, guarded by a mutex that also serializes the
//! session's own concurrent API calls against its commit and abort.
//!
//! Besides the private transaction context, every session publishes a few
//! atomics the garbage collector reads without taking that mutex:
//!
//! - the kind of the running transaction (or idle),
//! - whether a short transaction is inside an API call right now,
//! - the step epoch of the short transaction,
//! - the valid epoch of the long or read-only transaction.
//!
//! All of them use sequentially consistent ordering; the floor computation
//! relies on a total order between "step published, then in-call raised"
//! and its own loads.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use epochkv_core::{Epoch, EpochClock, Error, Result, ResultInfo, TidWord, TxKind};
use parking_lot::{Mutex, MutexGuard};

use crate::transaction::TxContext;

/// Handle returned by `enter`. Stale handles (of a slot that was left and
/// re-entered) are rejected with `InvalidHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    slot: u32,
    generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}.{}", self.slot, self.generation)
    }
}

/// What the garbage collector sees of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionView {
    /// Kind of the running transaction; `None` when idle
    pub kind: Option<TxKind>,
    /// Short transaction currently inside an API call
    pub in_call: bool,
    /// Step epoch of a short transaction
    pub step_epoch: Epoch,
    /// Valid epoch of a long or read-only transaction
    pub valid_epoch: Epoch,
}

/// Private state of a session, behind its strand mutex.
#[derive(Debug, Default)]
pub struct SessionState {
    pub(crate) tx: Option<TxContext>,
    pub(crate) last_commit_tid: TidWord,
    pub(crate) result_info: Option<ResultInfo>,
}

const IDLE: u8 = 0;
const SHORT: u8 = 1;
const LONG: u8 = 2;
const READ_ONLY: u8 = 3;

/// One session slot.
#[derive(Debug)]
pub struct Session {
    occupied: AtomicBool,
    generation: AtomicU32,
    kind: AtomicU8,
    in_call: AtomicBool,
    step_epoch: AtomicU64,
    valid_epoch: AtomicU64,
    state: Mutex<SessionState>,
}

impl Session {
    fn new() -> Self {
        Session {
            occupied: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            kind: AtomicU8::new(IDLE),
            in_call: AtomicBool::new(false),
            step_epoch: AtomicU64::new(0),
            valid_epoch: AtomicU64::new(0),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Take the strand guard.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Whether `id` still names this slot's current occupant.
    fn matches(&self, id: SessionId) -> bool {
        self.occupied.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == id.generation
    }

    pub(crate) fn publish_short(&self, step: Epoch) {
        self.step_epoch.store(step, Ordering::SeqCst);
        self.kind.store(SHORT, Ordering::SeqCst);
    }

    pub(crate) fn publish_long(&self, valid: Epoch) {
        self.valid_epoch.store(valid, Ordering::SeqCst);
        self.kind.store(LONG, Ordering::SeqCst);
    }

    pub(crate) fn publish_read_only(&self, valid: Epoch) {
        self.valid_epoch.store(valid, Ordering::SeqCst);
        self.kind.store(READ_ONLY, Ordering::SeqCst);
    }

    pub(crate) fn publish_idle(&self) {
        self.kind.store(IDLE, Ordering::SeqCst);
    }

    /// Mark an API call of a short transaction in progress. The step epoch
    /// is refreshed first, then the in-call flag is raised; the returned
    /// guard lowers it again.
    pub(crate) fn enter_call(&self, clock: &EpochClock) -> Option<CallGuard<'_>> {
        if self.kind.load(Ordering::SeqCst) != SHORT {
            return None;
        }
        self.step_epoch.store(clock.current(), Ordering::SeqCst);
        self.in_call.store(true, Ordering::SeqCst);
        Some(CallGuard { session: self })
    }

    /// Current step epoch.
    pub(crate) fn step_epoch(&self) -> Epoch {
        self.step_epoch.load(Ordering::SeqCst)
    }

    /// Published state.
    pub fn view(&self) -> SessionView {
        let kind = match self.kind.load(Ordering::SeqCst) {
            SHORT => Some(TxKind::Short),
            LONG => Some(TxKind::Long),
            READ_ONLY => Some(TxKind::ReadOnly),
            _ => None,
        };
        SessionView {
            kind,
            in_call: self.in_call.load(Ordering::SeqCst),
            step_epoch: self.step_epoch.load(Ordering::SeqCst),
            valid_epoch: self.valid_epoch.load(Ordering::SeqCst),
        }
    }
}

/// Lowers a session's in-call flag on drop.
#[derive(Debug)]
pub(crate) struct CallGuard<'a> {
    session: &'a Session,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.session.in_call.store(false, Ordering::SeqCst);
    }
}

/// Fixed array of session slots.
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Session>,
}

impl SessionTable {
    /// Table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        SessionTable {
            slots: (0..capacity.max(1)).map(|_| Session::new()).collect(),
        }
    }

    /// Occupy a free slot.
    pub fn enter(&self) -> Result<SessionId> {
        for (slot, session) in self.slots.iter().enumerate() {
            if session
                .occupied
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(SessionId {
                    slot: slot as u32,
                    generation: session.generation.load(Ordering::SeqCst),
                });
            }
        }
        Err(Error::SessionLimit(self.slots.len()))
    }

    /// Session named by `id`.
    pub fn get(&self, id: SessionId) -> Result<&Session> {
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.matches(id))
            .ok_or(Error::InvalidHandle)
    }

    /// Re-check `id` while holding the session's strand guard.
    pub(crate) fn check(&self, session: &Session, id: SessionId) -> Result<()> {
        if session.matches(id) {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }

    /// Give the slot back. The caller has already concluded its
    /// transaction and holds the strand guard.
    pub(crate) fn release(&self, session: &Session) {
        session.publish_idle();
        session.generation.fetch_add(1, Ordering::SeqCst);
        session.occupied.store(false, Ordering::SeqCst);
    }

    /// Published views of all occupied sessions.
    pub fn views(&self) -> Vec<SessionView> {
        self.slots
            .iter()
            .filter(|s| s.occupied.load(Ordering::SeqCst))
            .map(Session::view)
            .collect()
    }

    /// Occupied sessions.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter(|s| s.occupied.load(Ordering::SeqCst))
    }

    /// Number of occupied slots.
    pub fn active_count(&self) -> usize {
        self.occupied().count()
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
