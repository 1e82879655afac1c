//! Commit-time validation of short transactions
//!
//! Rules:
//! - A read is valid when the record still carries the tid it was read
//!   under, is not locked by another committer, and was not unhooked.
//! - A point lookup that missed, or a scan, is valid when every captured
//!   index gap stamp is unchanged (no phantom).
//! - No storage the transaction touched may carry a write-preserve
//!   reservation at or below the commit epoch.
//! - Blind writes are not validated.
//!
//! All conflicts are accumulated; the first one becomes the session's
//! result info.

use std::sync::Arc;

use epochkv_core::{AbortReason, Epoch, LtxId, ResultInfo, StorageId, TidWord};
use epochkv_storage::{NodeVersion, Record, Storage};
use rustc_hash::FxHashSet;

use crate::transaction::ReadEntry;

/// Kinds of conflicts found at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// The record was overwritten since it was read
    ReadChanged {
        /// Storage of the record
        storage: StorageId,
        /// Key of the record
        key: Vec<u8>,
        /// Tid recorded at read time
        read_tid: TidWord,
        /// Tid at validation time
        current_tid: TidWord,
    },

    /// Another committer holds the record's lock
    ReadLocked {
        /// Storage of the record
        storage: StorageId,
        /// Key of the record
        key: Vec<u8>,
    },

    /// The record was removed from the index by the garbage collector
    Unhooked {
        /// Storage of the record
        storage: StorageId,
        /// Key of the record
        key: Vec<u8>,
    },

    /// A key appeared in or vanished from a range the transaction looked at
    Phantom,

    /// A long transaction reserved a storage the transaction touched
    WritePreserve {
        /// Reserved storage
        storage: StorageId,
        /// Reserving transaction
        ltx: LtxId,
    },
}

impl ConflictType {
    /// Result info reported for this conflict.
    pub fn info(&self) -> ResultInfo {
        match self {
            ConflictType::ReadChanged { storage, key, .. }
            | ConflictType::ReadLocked { storage, key }
            | ConflictType::Unhooked { storage, key } => {
                ResultInfo::new(AbortReason::OccReadVerify).at(*storage, key)
            }
            ConflictType::Phantom => ResultInfo::new(AbortReason::OccPhantom),
            ConflictType::WritePreserve { storage, .. } => {
                ResultInfo::new(AbortReason::OccWritePreserve).in_storage(*storage)
            }
        }
    }
}

/// Conflicts gathered by one commit-time check.
///
/// Read-set, node-set and write-preserve checks each return one; the commit
/// path reports the first conflict as the abort cause.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// In detection order.
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// No conflicts.
    pub fn ok() -> Self {
        ValidationResult::default()
    }

    /// A single conflict.
    pub fn conflict(conflict: ConflictType) -> Self {
        ValidationResult {
            conflicts: vec![conflict],
        }
    }

    /// Whether validation passed.
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Merge another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Number of conflicts.
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// Result info of the first conflict.
    pub fn first_info(&self) -> Option<ResultInfo> {
        self.conflicts.first().map(ConflictType::info)
    }
}

/// Addresses of records whose lock the validating transaction holds.
#[derive(Debug, Default)]
pub struct OwnLocks(FxHashSet<usize>);

impl OwnLocks {
    /// Remember a locked record.
    pub fn insert(&mut self, record: &Arc<Record>) {
        self.0.insert(Arc::as_ptr(record) as usize);
    }

    /// Whether the transaction holds `record`'s lock.
    pub fn contains(&self, record: &Arc<Record>) -> bool {
        self.0.contains(&(Arc::as_ptr(record) as usize))
    }
}

/// Re-check every read against the records' current tids.
pub fn validate_read_set(read_set: &[ReadEntry], own: &OwnLocks) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for read in read_set {
        let storage = read.storage.id();
        let key = read.record.key();
        let current = read.record.tid().load();
        if !current.same_version(read.tid) {
            result.conflicts.push(ConflictType::ReadChanged {
                storage,
                key: key.to_vec(),
                read_tid: read.tid,
                current_tid: current,
            });
        } else if current.is_locked() && !own.contains(&read.record) {
            result.conflicts.push(ConflictType::ReadLocked {
                storage,
                key: key.to_vec(),
            });
        } else if read.record.is_unhooked() {
            result.conflicts.push(ConflictType::Unhooked {
                storage,
                key: key.to_vec(),
            });
        }
    }
    result
}

/// Re-check every captured gap stamp.
pub fn validate_node_set(nodes: &[NodeVersion]) -> ValidationResult {
    if nodes.iter().all(NodeVersion::is_current) {
        ValidationResult::ok()
    } else {
        ValidationResult::conflict(ConflictType::Phantom)
    }
}

/// Check the touched storages for reservations at or below `epoch`.
pub fn validate_write_preserve<'a>(
    storages: impl IntoIterator<Item = &'a Arc<Storage>>,
    epoch: Epoch,
) -> ValidationResult {
    let mut result = ValidationResult::ok();
    let mut seen = FxHashSet::default();
    for storage in storages {
        if !seen.insert(storage.id()) {
            continue;
        }
        if let Some(ltx) = storage.wp().conflicting(epoch) {
            result.conflicts.push(ConflictType::WritePreserve {
                storage: storage.id(),
                ltx,
            });
        }
    }
    result
}
