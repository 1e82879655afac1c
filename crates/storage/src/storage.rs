//! One logical keyspace
//!
//! A `Storage` bundles the ordered index of its records, the arena their
//! versions live in, and its write-preserve metadata. The record-level read
//! and install helpers live here because they need both the record and the
//! arena.

use std::sync::Arc;

use epochkv_core::{Epoch, Error, Result, StorageId, TidWord};
use serde::Serialize;
use tracing::error;

use crate::index::OrderedIndex;
use crate::record::Record;
use crate::version::{Version, VersionArena};
use crate::wp_meta::WpMeta;

/// Result of an optimistic read of the newest version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatestRead {
    /// A committed value and the tid it was read under
    Present {
        /// Tid observed before and after the value read
        tid: TidWord,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Tombstone or inserting page
    Absent {
        /// Observed tid
        tid: TidWord,
    },
}

impl LatestRead {
    /// Observed tid.
    pub fn tid(&self) -> TidWord {
        match self {
            LatestRead::Present { tid, .. } | LatestRead::Absent { tid } => *tid,
        }
    }
}

/// Per-storage statistics gathered by the garbage collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    /// Storage the numbers belong to
    pub storage: StorageId,
    /// Keys in the index (live, inserting and tombstoned)
    pub entries: usize,
    /// Keys with a live value
    pub live_entries: usize,
    /// Mean number of versions per key
    pub avg_version_chain_len: f64,
    /// Mean key length in bytes
    pub avg_key_size: f64,
    /// Mean length of the newest value in bytes, over live keys
    pub avg_value_size: f64,
    /// Tombstones unhooked since the storage was created
    pub unhooked_total: u64,
    /// Versions pruned since the storage was created
    pub pruned_versions_total: u64,
}

/// One logical keyspace.
#[derive(Debug)]
pub struct Storage {
    id: StorageId,
    index: OrderedIndex,
    versions: VersionArena,
    wp: WpMeta,
}

impl Storage {
    /// Empty storage allowing `wp_capacity` concurrent reservations.
    pub fn new(id: StorageId, wp_capacity: usize) -> Self {
        Storage {
            id,
            index: OrderedIndex::new(),
            versions: VersionArena::new(),
            wp: WpMeta::new(id, wp_capacity),
        }
    }

    /// Storage id.
    pub fn id(&self) -> StorageId {
        self.id
    }

    /// Record index.
    pub fn index(&self) -> &OrderedIndex {
        &self.index
    }

    /// Version arena.
    pub fn versions(&self) -> &VersionArena {
        &self.versions
    }

    /// Write-preserve metadata.
    pub fn wp(&self) -> &WpMeta {
        &self.wp
    }

    /// Optimistically read the newest version of `record`.
    ///
    /// The tid is loaded before and after the value; a torn read retries up
    /// to `spins` times before giving up with `ConcurrentUpdate`.
    pub fn read_latest(&self, record: &Record, spins: usize) -> Result<LatestRead> {
        for _ in 0..=spins {
            let Some(before) = record.tid().load_unlocked(spins) else {
                return Err(Error::ConcurrentUpdate(self.id));
            };
            if before.is_absent() {
                return Ok(LatestRead::Absent { tid: before });
            }
            let value = record.head().and_then(|h| self.versions.value(h));
            if record.tid().load() != before {
                std::hint::spin_loop();
                continue;
            }
            return match value {
                Some(Some(value)) => Ok(LatestRead::Present { tid: before, value }),
                _ => {
                    error!(target: "epochkv::storage", storage = %self.id, "live record has no value");
                    Err(Error::Fatal(format!("live record in {} has no value", self.id)))
                }
            };
        }
        Err(Error::ConcurrentUpdate(self.id))
    }

    /// Value of `record` as of a snapshot: the newest version committed in
    /// an epoch before `valid_epoch`. `None` when that version is a delete or
    /// there is none.
    pub fn read_as_of(&self, record: &Record, valid_epoch: Epoch) -> Option<Vec<u8>> {
        self.versions
            .find(record.head(), |v| v.epoch() < valid_epoch)
            .and_then(|v| v.value)
    }

    /// Newest version committed at or before `epoch`, including deletes.
    pub fn newest_at_or_before(&self, record: &Record, epoch: Epoch) -> Option<Version> {
        self.versions.find(record.head(), |v| v.epoch() <= epoch)
    }

    /// Install a committed write on `record`. Caller holds the record lock
    /// and publishes `tid` on the record afterwards.
    ///
    /// A write in the epoch of the current head replaces it in place; a
    /// write in a later epoch prepends a new version so snapshot readers
    /// keep the old one.
    pub fn install(&self, record: &Record, tid: TidWord, value: Option<Vec<u8>>) -> Result<()> {
        let tid = tid.with_lock(false);
        let head = record.head();
        let head_tid = head.and_then(|h| self.versions.tid(h).map(|t| (h, t)));
        match head_tid {
            Some((_, current)) if current.epoch() > tid.epoch() => {
                error!(
                    target: "epochkv::storage",
                    storage = %self.id,
                    head_epoch = current.epoch(),
                    write_epoch = tid.epoch(),
                    "write older than the newest version"
                );
                Err(Error::Fatal(format!(
                    "write at epoch {} behind head epoch {} in {}",
                    tid.epoch(),
                    current.epoch(),
                    self.id
                )))
            }
            Some((h, current)) if current.epoch() == tid.epoch() => {
                self.versions.overwrite(h, tid, value);
                Ok(())
            }
            _ => {
                let handle = self.versions.alloc(Version {
                    tid,
                    value,
                    next: head,
                });
                record.set_head(Some(handle));
                Ok(())
            }
        }
    }

    /// Gather the statistics of this storage.
    pub fn stats(&self, unhooked_total: u64, pruned_versions_total: u64) -> StorageStats {
        let records = self.index.records();
        let mut stats = StorageStats {
            storage: self.id,
            entries: records.len(),
            unhooked_total,
            pruned_versions_total,
            ..StorageStats::default()
        };
        if records.is_empty() {
            return stats;
        }
        let mut chain = 0usize;
        let mut key_bytes = 0usize;
        let mut value_bytes = 0usize;
        for record in &records {
            chain += self.versions.chain_len(record.head());
            key_bytes += record.key().len();
            if record.tid().load().is_absent() {
                continue;
            }
            if let Some(Some(value)) = record.head().and_then(|h| self.versions.value(h)) {
                stats.live_entries += 1;
                value_bytes += value.len();
            }
        }
        let n = records.len() as f64;
        stats.avg_version_chain_len = chain as f64 / n;
        stats.avg_key_size = key_bytes as f64 / n;
        if stats.live_entries > 0 {
            stats.avg_value_size = value_bytes as f64 / stats.live_entries as f64;
        }
        stats
    }
}

/// Convenience for tests and bootstrapping: a committed record holding
/// `value` at `tid`, already linked into `storage`'s index.
pub fn load_record(storage: &Storage, key: &[u8], tid: TidWord, value: &[u8]) -> Option<Arc<Record>> {
    let handle = storage.versions.alloc(Version {
        tid,
        value: Some(value.to_vec()),
        next: None,
    });
    let record = Arc::new(Record::committed(key, tid, handle));
    match storage.index.insert_if_absent(Arc::clone(&record)) {
        Ok(_) => Some(record),
        Err(_) => {
            storage.versions.retire_chain(Some(handle));
            None
        }
    }
}
