//! Transaction context
//!
//! A `TxContext` is everything one running transaction keeps locally: its
//! kind and epochs, the read set, the write set, the node set used for
//! phantom detection, open scans, and for long transactions the
//! write-preserve and forwarding state.
//!
//! Writes are buffered. Repeated writes to the same key within one
//! transaction fold into a single write-set entry:
//!
//! ```text
//! prev \ next | Insert         Update     Upsert     Delete
//! ------------+------------------------------------------------
//! Insert      | ALREADY_EXISTS Insert     Insert     Cancelled
//! Update      | ALREADY_EXISTS Update     Update     Delete
//! Upsert      | ALREADY_EXISTS Upsert     Upsert     Delete
//! Delete      | Update         NOT_FOUND  Update     NOT_FOUND
//! Cancelled   | Insert         NOT_FOUND  Insert     NOT_FOUND
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use epochkv_core::{Epoch, Error, KeyRange, Result, ResultInfo, StorageId, TidWord, TxKind};
use epochkv_storage::{LongTxState, NodeVersion, Record, Storage};
use serde::Serialize;

use crate::scan::ScanTable;

/// Externally visible state of a session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TxState {
    /// No transaction has begun on the session
    Inactive,
    /// Running
    Active,
    /// Inside its commit protocol
    Committing,
    /// Long transaction waiting for higher-priority long transactions
    WaitingForOtherTx,
    /// Committed
    Durable,
    /// Aborted
    Aborted,
}

/// Successful outcome of `commit` / `check_commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommitStatus {
    /// The transaction committed
    Committed,
    /// Higher-priority long transactions must conclude first; poll with
    /// `check_commit`
    WaitingForOtherTx,
}

/// Storages a long transaction declares it will, or will not, read.
///
/// An empty positive list means "anything not forbidden".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadArea {
    /// Storages that may be read
    pub positive: Vec<StorageId>,
    /// Storages that must not be read
    pub negative: Vec<StorageId>,
}

impl ReadArea {
    /// Unrestricted read area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a readable storage.
    pub fn allow(mut self, storage: StorageId) -> Self {
        self.positive.push(storage);
        self
    }

    /// Add a forbidden storage.
    pub fn forbid(mut self, storage: StorageId) -> Self {
        self.negative.push(storage);
        self
    }

    /// Whether a positive list was given.
    pub fn is_restricted(&self) -> bool {
        !self.positive.is_empty()
    }
}

/// Options passed to `begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOptions {
    kind: TxKind,
    write_preserve: Vec<StorageId>,
    read_area: ReadArea,
}

impl TxOptions {
    /// Optimistic short transaction.
    pub fn short() -> Self {
        TxOptions {
            kind: TxKind::Short,
            write_preserve: Vec::new(),
            read_area: ReadArea::default(),
        }
    }

    /// Long transaction write-preserving `storages`.
    pub fn long(storages: impl IntoIterator<Item = StorageId>) -> Self {
        let mut write_preserve: Vec<StorageId> = storages.into_iter().collect();
        write_preserve.sort_unstable();
        write_preserve.dedup();
        TxOptions {
            kind: TxKind::Long,
            write_preserve,
            read_area: ReadArea::default(),
        }
    }

    /// Snapshot read-only transaction.
    pub fn read_only() -> Self {
        TxOptions {
            kind: TxKind::ReadOnly,
            write_preserve: Vec::new(),
            read_area: ReadArea::default(),
        }
    }

    /// Declare a read area (long transactions only).
    pub fn with_read_area(mut self, read_area: ReadArea) -> Self {
        self.read_area = read_area;
        self
    }

    /// Transaction kind.
    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// Write-preserved storages, sorted and deduplicated.
    pub fn write_preserve(&self) -> &[StorageId] {
        &self.write_preserve
    }

    /// Declared read area.
    pub fn read_area(&self) -> &ReadArea {
        &self.read_area
    }
}

impl Default for TxOptions {
    fn default() -> Self {
        Self::short()
    }
}

/// Buffered write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Key must be absent
    Insert,
    /// Key must be present
    Update,
    /// Key may be either
    Upsert,
    /// Key must be present
    Delete,
    /// Insert followed by delete; nothing is written
    Cancelled,
}

impl WriteOp {
    /// Fold a later operation on the same key into this one.
    pub fn then(self, next: WriteOp) -> Result<WriteOp> {
        use WriteOp::*;
        match (self, next) {
            (_, Cancelled) => Ok(Cancelled),
            (Insert | Update | Upsert, Insert) => Err(Error::AlreadyExists),
            (Insert, Update | Upsert) => Ok(Insert),
            (Insert, Delete) => Ok(Cancelled),
            (Update, Update | Upsert) => Ok(Update),
            (Upsert, Update | Upsert) => Ok(Upsert),
            (Update | Upsert, Delete) => Ok(Delete),
            (Delete, Insert | Upsert) => Ok(Update),
            (Cancelled, Insert | Upsert) => Ok(Insert),
            (Delete | Cancelled, Update | Delete) => Err(Error::NotFound),
        }
    }

    /// Whether the operation leaves a value behind.
    pub fn writes_value(self) -> bool {
        matches!(self, WriteOp::Insert | WriteOp::Update | WriteOp::Upsert)
    }
}

/// How a short transaction's insert holds on to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertClaim {
    /// No claim
    None,
    /// The transaction created the inserting page and owns it
    FreshPage,
    /// The transaction shares an existing tombstone
    SharedTombstone,
}

/// One write-set entry.
#[derive(Debug)]
pub struct WriteEntry {
    /// Target storage
    pub storage: Arc<Storage>,
    /// Target record; long transactions resolve it at commit
    pub record: Option<Arc<Record>>,
    /// Operation
    pub op: WriteOp,
    /// Value for value-writing operations
    pub value: Option<Vec<u8>>,
    /// Insert claim held on `record`
    pub claim: InsertClaim,
}

/// What the write set says about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalView<'a> {
    /// The transaction wrote this value
    Value(&'a [u8]),
    /// The transaction deleted the key (or cancelled its insert)
    Deleted,
}

/// Write set ordered by `(storage, key)`, which is also the lock order.
#[derive(Debug, Default)]
pub struct WriteSet {
    entries: BTreeMap<(StorageId, Vec<u8>), WriteEntry>,
}

impl WriteSet {
    /// Entry for a key.
    pub fn get(&self, storage: StorageId, key: &[u8]) -> Option<&WriteEntry> {
        self.entries.get(&(storage, key.to_vec()))
    }

    /// Mutable entry for a key.
    pub fn get_mut(&mut self, storage: StorageId, key: &[u8]) -> Option<&mut WriteEntry> {
        self.entries.get_mut(&(storage, key.to_vec()))
    }

    /// Add a new entry.
    pub fn insert(&mut self, key: &[u8], entry: WriteEntry) {
        self.entries.insert((entry.storage.id(), key.to_vec()), entry);
    }

    /// The transaction's own view of a key, if it wrote it.
    pub fn local_view(&self, storage: StorageId, key: &[u8]) -> Option<LocalView<'_>> {
        self.get(storage, key).map(|e| match (&e.value, e.op.writes_value()) {
            (Some(v), true) => LocalView::Value(v.as_slice()),
            _ => LocalView::Deleted,
        })
    }

    /// Entries of `storage` whose key lies in `range`, in key order.
    pub fn in_range<'a>(
        &'a self,
        storage: StorageId,
        range: &'a KeyRange,
    ) -> impl Iterator<Item = (&'a [u8], &'a WriteEntry)> + 'a {
        self.entries
            .range((Bound::Included((storage, Vec::new())), Bound::Unbounded))
            .take_while(move |((s, _), _)| *s == storage)
            .filter(move |((_, k), _)| range.contains(k))
            .map(|((_, k), e)| (k.as_slice(), e))
    }

    /// All entries in lock order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &WriteEntry)> {
        self.entries.iter().map(|((_, k), e)| (k.as_slice(), e))
    }

    /// All entries in lock order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&[u8], &mut WriteEntry)> {
        self.entries.iter_mut().map(|((_, k), e)| (k.as_slice(), e))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry out.
    pub fn drain(&mut self) -> Vec<(Vec<u8>, WriteEntry)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|((_, k), e)| (k, e))
            .collect()
    }
}

/// One read-set entry: the record and the tid the value was read under.
#[derive(Debug, Clone)]
pub struct ReadEntry {
    /// Storage of the record
    pub storage: Arc<Storage>,
    /// Record read
    pub record: Arc<Record>,
    /// Observed tid
    pub tid: TidWord,
}

/// Higher-priority long transaction this one must commit after.
#[derive(Debug, Clone)]
pub struct ForwardDep {
    /// The other transaction
    pub ltx: Arc<LongTxState>,
    /// Ranges this transaction read while the other one could still write
    /// them underneath
    pub ranges: Vec<(StorageId, KeyRange)>,
}

/// Long-transaction-only state.
#[derive(Debug)]
pub struct LtxContext {
    /// Shared state published to reservations and dependents
    pub state: Arc<LongTxState>,
    /// Write-preserved storages, sorted
    pub write_preserve: Vec<StorageId>,
    /// Declared read area
    pub read_area: ReadArea,
    /// Forwarding dependencies
    pub deps: Vec<ForwardDep>,
}

impl LtxContext {
    /// Whether `storage` is write-preserved.
    pub fn preserves(&self, storage: StorageId) -> bool {
        self.write_preserve.binary_search(&storage).is_ok()
    }

    /// Record a dependency on `ltx`, optionally with a range read in
    /// `storage`.
    pub fn add_dep(&mut self, ltx: &Arc<LongTxState>, storage: StorageId, range: Option<&KeyRange>) {
        let pos = match self.deps.iter().position(|d| d.ltx.id() == ltx.id()) {
            Some(pos) => pos,
            None => {
                self.deps.push(ForwardDep {
                    ltx: Arc::clone(ltx),
                    ranges: Vec::new(),
                });
                self.deps.len() - 1
            }
        };
        if let Some(range) = range {
            let dep = &mut self.deps[pos];
            if !dep.ranges.iter().any(|(s, r)| *s == storage && r == range) {
                dep.ranges.push((storage, range.clone()));
            }
        }
    }
}

/// Local state of one running transaction.
#[derive(Debug)]
pub struct TxContext {
    pub(crate) kind: TxKind,
    pub(crate) status: TxState,
    pub(crate) step_epoch: Epoch,
    pub(crate) valid_epoch: Epoch,
    pub(crate) read_set: Vec<ReadEntry>,
    pub(crate) write_set: WriteSet,
    pub(crate) node_set: Vec<NodeVersion>,
    pub(crate) index_storages: Vec<Arc<Storage>>,
    pub(crate) scans: ScanTable,
    pub(crate) ltx: Option<LtxContext>,
    pub(crate) abort_info: Option<ResultInfo>,
}

impl TxContext {
    fn with_kind(kind: TxKind, step_epoch: Epoch, valid_epoch: Epoch) -> Self {
        TxContext {
            kind,
            status: TxState::Active,
            step_epoch,
            valid_epoch,
            read_set: Vec::new(),
            write_set: WriteSet::default(),
            node_set: Vec::new(),
            index_storages: Vec::new(),
            scans: ScanTable::default(),
            ltx: None,
            abort_info: None,
        }
    }

    /// Short transaction begun in `epoch`.
    pub fn short(epoch: Epoch) -> Self {
        Self::with_kind(TxKind::Short, epoch, epoch)
    }

    /// Long transaction.
    pub fn long(ltx: LtxContext, begin_epoch: Epoch) -> Self {
        let valid = ltx.state.valid_epoch();
        let mut ctx = Self::with_kind(TxKind::Long, begin_epoch, valid);
        ctx.ltx = Some(ltx);
        ctx
    }

    /// Read-only transaction reading the snapshot below `valid_epoch`.
    pub fn read_only(begin_epoch: Epoch, valid_epoch: Epoch) -> Self {
        Self::with_kind(TxKind::ReadOnly, begin_epoch, valid_epoch)
    }

    /// Transaction kind.
    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// Current state.
    pub fn status(&self) -> TxState {
        self.status
    }

    /// Snapshot boundary of long and read-only transactions.
    pub fn valid_epoch(&self) -> Epoch {
        self.valid_epoch
    }

    /// Whether the transaction still accepts operations.
    pub fn is_active(&self) -> bool {
        self.status == TxState::Active
    }

    /// Whether the transaction committed or aborted.
    pub fn is_concluded(&self) -> bool {
        matches!(self.status, TxState::Durable | TxState::Aborted)
    }

    /// Fail unless the transaction accepts data operations.
    pub fn ensure_active(&self, op: &'static str) -> Result<()> {
        match self.status {
            TxState::Active => Ok(()),
            TxState::Committing | TxState::WaitingForOtherTx => Err(Error::illegal(self.kind, op)),
            TxState::Inactive | TxState::Durable | TxState::Aborted => Err(Error::NotBegin),
        }
    }

    /// Number of read-set entries.
    pub fn read_count(&self) -> usize {
        self.read_set.len()
    }

    /// Number of write-set entries.
    pub fn write_count(&self) -> usize {
        self.write_set.len()
    }

    /// Note why the transaction has to abort and return the matching error.
    /// The caller's dispatcher rolls the transaction back.
    pub(crate) fn conflict(&mut self, info: ResultInfo) -> Error {
        let reason = info.reason;
        self.abort_info = Some(info);
        Error::Aborted(reason)
    }

    /// Remember a storage whose index a missed lookup or a scan consulted,
    /// for the write-preserve check at commit.
    pub(crate) fn observe_index(&mut self, storage: &Arc<Storage>) {
        if !self.index_storages.iter().any(|s| s.id() == storage.id()) {
            self.index_storages.push(Arc::clone(storage));
        }
    }

    /// Drop every local set. Claims held by write-set entries must have
    /// been released already.
    pub(crate) fn clear(&mut self) {
        self.read_set.clear();
        self.write_set = WriteSet::default();
        self.node_set.clear();
        self.index_storages.clear();
        self.scans.clear();
        if let Some(ltx) = self.ltx.as_mut() {
            ltx.deps.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_op_folding() {
        use WriteOp::*;
        assert_eq!(Insert.then(Update).unwrap(), Insert);
        assert_eq!(Insert.then(Delete).unwrap(), Cancelled);
        assert_eq!(Cancelled.then(Insert).unwrap(), Insert);
        assert_eq!(Delete.then(Insert).unwrap(), Update);
        assert_eq!(Delete.then(Upsert).unwrap(), Update);
        assert_eq!(Upsert.then(Update).unwrap(), Upsert);
        assert_eq!(Update.then(Delete).unwrap(), Delete);
        assert_eq!(Insert.then(Insert), Err(Error::AlreadyExists));
        assert_eq!(Delete.then(Delete), Err(Error::NotFound));
        assert_eq!(Cancelled.then(Update), Err(Error::NotFound));
    }

    #[test]
    fn options_normalise_write_preserve() {
        let opts = TxOptions::long([StorageId(3), StorageId(1), StorageId(3)]);
        assert_eq!(opts.kind(), TxKind::Long);
        assert_eq!(opts.write_preserve(), &[StorageId(1), StorageId(3)]);
        assert_eq!(TxOptions::default().kind(), TxKind::Short);
    }

    #[test]
    fn read_area_builder() {
        let area = ReadArea::new().allow(StorageId(1)).forbid(StorageId(2));
        assert!(area.is_restricted());
        assert!(!ReadArea::new().is_restricted());
    }

    #[test]
    fn write_set_range_and_local_view() {
        let a = Arc::new(Storage::new(StorageId(1), 4));
        let b = Arc::new(Storage::new(StorageId(2), 4));
        let mut ws = WriteSet::default();
        for (storage, key, op) in [
            (&a, b"k1", WriteOp::Insert),
            (&a, b"k2", WriteOp::Delete),
            (&a, b"k9", WriteOp::Update),
            (&b, b"k1", WriteOp::Upsert),
        ] {
            ws.insert(
                key,
                WriteEntry {
                    storage: Arc::clone(storage),
                    record: None,
                    op,
                    value: op.writes_value().then(|| b"v".to_vec()),
                    claim: InsertClaim::None,
                },
            );
        }
        let range = KeyRange::closed(b"k1", b"k5");
        let keys: Vec<&[u8]> = ws.in_range(StorageId(1), &range).map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"k1"[..], &b"k2"[..]]);

        assert_eq!(ws.local_view(StorageId(1), b"k1"), Some(LocalView::Value(b"v")));
        assert_eq!(ws.local_view(StorageId(1), b"k2"), Some(LocalView::Deleted));
        assert_eq!(ws.local_view(StorageId(1), b"zz"), None);
        assert_eq!(ws.len(), 4);
    }

    #[test]
    fn ensure_active_by_state() {
        let mut ctx = TxContext::short(1);
        assert!(ctx.ensure_active("search_key").is_ok());
        ctx.status = TxState::WaitingForOtherTx;
        assert!(matches!(
            ctx.ensure_active("search_key"),
            Err(Error::IllegalOperation { .. })
        ));
        ctx.status = TxState::Durable;
        assert_eq!(ctx.ensure_active("search_key"), Err(Error::NotBegin));
    }
}
