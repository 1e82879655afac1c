//! Shared test utilities for the integration suites.
//!
//! Import via `mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

pub use epochkv::{
    AbortReason, CommitStatus, Database, Error, ReadArea, ScanEndpoint, SessionId, Status,
    StorageId, TxOptions, TxState,
};

// ============================================================================
// TestDb - database wrapper with one default storage
// ============================================================================

/// Database plus a storage most tests write into.
pub struct TestDb {
    pub db: Arc<Database>,
    pub st: StorageId,
}

impl TestDb {
    /// Epochs only move on `advance`.
    pub fn manual() -> Self {
        Self::from_db(Database::builder().manual_epochs().open().unwrap())
    }

    /// Background ticker with a 1 ms epoch.
    pub fn ticking() -> Self {
        Self::from_db(
            Database::builder()
                .epoch_duration(Duration::from_millis(1))
                .open()
                .unwrap(),
        )
    }

    fn from_db(db: Arc<Database>) -> Self {
        let st = db.create_storage(None).unwrap();
        TestDb { db, st }
    }

    pub fn session(&self) -> SessionId {
        self.db.enter().unwrap()
    }

    pub fn advance(&self, epochs: usize) {
        for _ in 0..epochs {
            self.db.advance_epoch();
        }
    }

    /// Commit `key = value` in its own short transaction.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let sid = self.session();
        retry_short(&self.db, sid, |db| db.upsert(sid, self.st, key, value));
        self.db.leave(sid).unwrap();
    }

    /// Latest committed value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let sid = self.session();
        let value = retry_short(&self.db, sid, |db| match db.search_key(sid, self.st, key) {
            Ok(v) => Ok(Some(v)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        });
        self.db.leave(sid).unwrap();
        value
    }

    /// Begin a long transaction reserving `storages`.
    pub fn begin_long(&self, storages: &[StorageId]) -> SessionId {
        let sid = self.session();
        self.db
            .begin(sid, &TxOptions::long(storages.iter().copied()))
            .unwrap();
        sid
    }
}

/// Run `body` in short transactions until one commits.
pub fn retry_short<T>(
    db: &Database,
    sid: SessionId,
    mut body: impl FnMut(&Database) -> Result<T, Error>,
) -> T {
    loop {
        db.begin(sid, &TxOptions::short()).unwrap();
        let outcome = body(db).and_then(|out| db.commit(sid).map(|_| out));
        match outcome {
            Ok(out) => return out,
            Err(e) if e.is_abort() => {}
            Err(Error::ConcurrentInsert(_)) | Err(Error::ConcurrentUpdate(_)) => {
                db.abort(sid).unwrap();
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

pub fn encode(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

pub fn decode(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().unwrap())
}
