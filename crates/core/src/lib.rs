//! Core types for epochkv
//!
//! This crate defines the foundational types used throughout the engine:
//! - TidWord / AtomicTidWord: packed lock + timestamp word of a record
//! - EpochClock: global epoch and safe snapshot epoch
//! - StorageId, LtxId, TxKind, ScanEndpoint, KeyRange
//! - Status, Error, AbortReason, ResultInfo: the status vocabulary

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod epoch;
pub mod error;
pub mod tid;
pub mod types;

pub use epoch::{Epoch, EpochClock, INITIAL_EPOCH};
pub use error::{AbortReason, Error, Result, ResultInfo, Status};
pub use tid::{AtomicTidWord, TidWord};
pub use types::{KeyRange, LtxId, ScanEndpoint, StorageId, TxKind};
