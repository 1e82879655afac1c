//! Concurrency layer for epochkv
//!
//! This crate implements the three transaction kinds over the storage layer:
//! - Short transactions (OCC): optimistic reads, buffered writes, lock and
//!   validate at commit, phantom detection through index node stamps
//! - Long transactions: write-preserve reservations, priority forwarding
//!   and a polling commit that waits for higher-priority long transactions
//! - Read-only transactions: lock-free reads of the safe snapshot
//!
//! Around them sit the session table, scan cursors, and the epoch-based
//! garbage collector. `TransactionManager` is the dispatch entry point.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod env;
pub mod gc;
mod long_tx;
pub mod manager;
mod read_only_tx;
pub mod scan;
pub mod session;
mod short_tx;
pub mod transaction;
pub mod validation;
mod wp;

pub use env::{ConcurrencyConfig, TxEnv};
pub use gc::{Floors, GarbageCollector, SweepReport};
pub use manager::TransactionManager;
pub use scan::ScanHandle;
pub use session::{SessionId, SessionView};
pub use transaction::{CommitStatus, ReadArea, TxContext, TxOptions, TxState, WriteOp};
pub use validation::{ConflictType, ValidationResult};
