//! Storage layer for epochkv
//!
//! This crate implements the versioned record model the concurrency layer
//! runs on:
//! - Record: atomic tid word, version chain head, shared tombstone count,
//!   read-by epochs
//! - VersionArena: version chains addressed by generation-checked handles
//! - OrderedIndex: ordered key index with per-gap node-version stamps for
//!   phantom detection
//! - WpMeta: write-preserve reservations, outcome log and read plan
//! - Storage / StorageRegistry: one keyspace and the map of all of them

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod index;
pub mod record;
pub mod registry;
pub mod storage;
pub mod version;
pub mod wp_meta;

pub use index::{Lookup, NodeChange, NodeVersion, OrderedIndex, ScanResult};
pub use record::{ReadByEpochs, Record, TombstoneClaim};
pub use registry::StorageRegistry;
pub use storage::{load_record, LatestRead, Storage, StorageStats};
pub use version::{Version, VersionArena, VersionHandle};
pub use wp_meta::{LongTxState, LtxOutcome, Reservation, WpMeta, WpOutcome};
