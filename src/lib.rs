//! epochkv - embedded transactional key-value engine
//!
//! epochkv keeps ordered byte-string keyspaces ("storages") in memory and
//! runs three kinds of transactions over them under a shared epoch clock:
//! - short transactions: optimistic, validated at commit
//! - long transactions: declare the storages they write up front and are
//!   ordered by begin priority
//! - read-only transactions: read a stable snapshot and never abort
//!
//! # Quick Start
//!
//! ```ignore
//! use epochkv::{Database, TxOptions};
//!
//! let db = Database::builder().open()?;
//! let accounts = db.create_storage(None)?;
//!
//! let sid = db.enter()?;
//! db.begin(sid, &TxOptions::short())?;
//! db.upsert(sid, accounts, b"alice", b"100")?;
//! db.commit(sid)?;
//!
//! db.begin(sid, &TxOptions::read_only())?;
//! let balance = db.search_key(sid, accounts, b"alice")?;
//! db.commit(sid)?;
//! db.leave(sid)?;
//! ```
//!
//! # Architecture
//!
//! All operations go through [`Database`], which owns the transaction
//! manager and the background epoch and garbage-collection threads. The
//! storage and concurrency layers are internal crates; only the engine API
//! is re-exported here.

pub use epochkv_engine::*;
