//! Scan cursors
//!
//! `open_scan` caches the records of a key range, in key order, next to the
//! transaction's own buffered writes in that range. The index gap stamps go
//! to the node set (short transactions) or the read plan (long ones) at that
//! point. Visibility is decided as the cursor reaches each record:
//! - short transactions read the newest version and register it in the
//!   read set, tombstones included;
//! - long and read-only transactions read the snapshot below their valid
//!   epoch.
//!
//! Records that turn out invisible are skipped, and only the value under the
//! cursor is copied out.

use std::collections::BTreeMap;
use std::sync::Arc;

use epochkv_core::{Error, KeyRange, Result, StorageId, TxKind};
use epochkv_storage::{Record, Storage};
use rustc_hash::FxHashMap;

use crate::env::TxEnv;
use crate::transaction::{LocalView, TxContext};
use crate::{long_tx, read_only_tx, short_tx};

/// Handle of an open scan, unique within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanHandle(pub u64);

#[derive(Debug)]
enum ScanSlot {
    Stored(Arc<Record>),
    Local { key: Vec<u8>, value: Vec<u8> },
}

/// Cached scan positions plus the cursor.
#[derive(Debug)]
pub struct ScanCache {
    storage: Arc<Storage>,
    slots: Vec<ScanSlot>,
    pos: usize,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl ScanCache {
    fn new(storage: Arc<Storage>, slots: Vec<ScanSlot>) -> Self {
        ScanCache {
            storage,
            slots,
            pos: 0,
            current: None,
        }
    }

    /// Storage the scan reads.
    pub fn storage(&self) -> StorageId {
        self.storage.id()
    }

    fn exhaust(&mut self) {
        self.pos = self.slots.len();
        self.current = None;
    }

    /// Key under the cursor.
    pub fn key(&self) -> Result<&[u8]> {
        self.current
            .as_ref()
            .map(|(k, _)| k.as_slice())
            .ok_or(Error::ScanLimit)
    }

    /// Value under the cursor.
    pub fn value(&self) -> Result<&[u8]> {
        self.current
            .as_ref()
            .map(|(_, v)| v.as_slice())
            .ok_or(Error::ScanLimit)
    }

    /// Number of cached positions, visible or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing was cached.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Open scans of one transaction.
#[derive(Debug, Default)]
pub struct ScanTable {
    next: u64,
    scans: FxHashMap<ScanHandle, ScanCache>,
}

impl ScanTable {
    fn open(&mut self, cache: ScanCache) -> ScanHandle {
        self.next += 1;
        let handle = ScanHandle(self.next);
        self.scans.insert(handle, cache);
        handle
    }

    /// Cache behind `handle`.
    pub fn get(&self, handle: ScanHandle) -> Result<&ScanCache> {
        self.scans.get(&handle).ok_or(Error::InvalidHandle)
    }

    fn get_mut(&mut self, handle: ScanHandle) -> Result<&mut ScanCache> {
        self.scans.get_mut(&handle).ok_or(Error::InvalidHandle)
    }

    /// Drop the scan behind `handle`.
    pub fn close(&mut self, handle: ScanHandle) -> Result<()> {
        self.scans
            .remove(&handle)
            .map(|_| ())
            .ok_or(Error::InvalidHandle)
    }

    /// Number of open scans.
    pub fn len(&self) -> usize {
        self.scans.len()
    }

    /// Whether no scan is open.
    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    /// Drop every scan.
    pub fn clear(&mut self) {
        self.scans.clear();
    }
}

/// Open a scan over `range` of `storage`, caching at most `max` positions
/// (`0` means no limit). A range with nothing visible is `NotFound`.
pub(crate) fn open_scan(
    env: &TxEnv,
    ctx: &mut TxContext,
    storage: StorageId,
    range: KeyRange,
    max: usize,
) -> Result<ScanHandle> {
    let storage = env.storage(storage)?;
    let records = match ctx.kind {
        TxKind::Short => short_tx::scan_records(ctx, &storage, &range)?,
        TxKind::Long => long_tx::scan_records(env, ctx, &storage, &range)?,
        TxKind::ReadOnly => read_only_tx::scan_records(&storage, &range),
    };

    let mut slots: BTreeMap<Vec<u8>, ScanSlot> = records
        .into_iter()
        .filter(|r| ctx.write_set.get(storage.id(), r.key()).is_none())
        .map(|r| (r.key().to_vec(), ScanSlot::Stored(r)))
        .collect();
    for (key, entry) in ctx.write_set.in_range(storage.id(), &range) {
        if let (Some(value), true) = (&entry.value, entry.op.writes_value()) {
            slots.insert(
                key.to_vec(),
                ScanSlot::Local {
                    key: key.to_vec(),
                    value: value.clone(),
                },
            );
        }
    }

    let limit = if max == 0 { usize::MAX } else { max };
    let slots = slots.into_values().take(limit).collect();
    let handle = ctx.scans.open(ScanCache::new(storage, slots));
    if let Err(e) = seek(env, ctx, handle, 0) {
        ctx.scans.close(handle)?;
        return Err(match e {
            Error::ScanLimit => Error::NotFound,
            e => e,
        });
    }
    Ok(handle)
}

/// Move the cursor forward. Once the cursor has passed the last visible
/// entry every call reports `ScanLimit`.
pub(crate) fn next_scan(env: &TxEnv, ctx: &mut TxContext, handle: ScanHandle) -> Result<()> {
    let pos = ctx.scans.get(handle)?.pos;
    seek(env, ctx, handle, pos.saturating_add(1))
}

/// Park the cursor on the first visible slot at or after `from`.
fn seek(env: &TxEnv, ctx: &mut TxContext, handle: ScanHandle, from: usize) -> Result<()> {
    let mut pos = from;
    loop {
        let cache = ctx.scans.get_mut(handle)?;
        let (storage, record) = match cache.slots.get(pos) {
            None => {
                cache.exhaust();
                return Err(Error::ScanLimit);
            }
            Some(ScanSlot::Local { key, value }) => {
                cache.current = Some((key.clone(), value.clone()));
                cache.pos = pos;
                return Ok(());
            }
            Some(ScanSlot::Stored(record)) => (Arc::clone(&cache.storage), Arc::clone(record)),
        };

        let value = match ctx.write_set.local_view(storage.id(), record.key()) {
            Some(LocalView::Value(v)) => Some(v.to_vec()),
            Some(LocalView::Deleted) => None,
            None => match ctx.kind {
                TxKind::Short => short_tx::observe(env, ctx, &storage, Arc::clone(&record))?,
                TxKind::Long | TxKind::ReadOnly => storage.read_as_of(&record, ctx.valid_epoch),
            },
        };
        if let Some(value) = value {
            let cache = ctx.scans.get_mut(handle)?;
            cache.current = Some((record.key().to_vec(), value));
            cache.pos = pos;
            return Ok(());
        }
        pos += 1;
    }
}
