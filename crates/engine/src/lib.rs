//! Engine for epochkv
//!
//! The `Database` facade ties the concurrency layer to a running clock:
//! - Database: sessions, transactions, point and scan operations, storage
//!   administration
//! - EngineConfig / DatabaseBuilder: `epochkv.toml` settings
//! - TransactionCoordinator: metrics and per-epoch duties
//! - BackgroundWorkers: epoch ticker and garbage-collection threads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod coordinator;
pub mod database;

pub use background::BackgroundWorkers;
pub use coordinator::{KindMetrics, TransactionCoordinator, TransactionMetrics};
pub use database::{Database, DatabaseBuilder, EngineConfig, CONFIG_FILE_NAME};

pub use epochkv_concurrency::{
    CommitStatus, ReadArea, ScanHandle, SessionId, SweepReport, TxOptions, TxState,
};
pub use epochkv_core::{
    AbortReason, Epoch, Error, KeyRange, Result, ResultInfo, ScanEndpoint, Status, StorageId, TxKind,
};
pub use epochkv_storage::StorageStats;
