//! Status vocabulary and error types
//!
//! Every engine operation returns `Result<T>`. The `Err` side is an [`Error`],
//! and every error maps onto exactly one [`Status`] code so callers can branch
//! on the coarse classification (warning, conflict, fatal) without matching
//! individual variants.
//!
//! Conflicts are reported as [`Error::Aborted`]: the transaction has already
//! been rolled back when the caller sees one. The reason is also kept on the
//! session as a [`ResultInfo`] for diagnostics.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::epoch::Epoch;
use crate::types::{StorageId, TxKind};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes of the engine's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    /// Success
    Ok,
    /// Key not found
    WarnNotFound,
    /// Key already exists
    WarnAlreadyExists,
    /// No transaction has begun on the session
    WarnNotBegin,
    /// A transaction is already running on the session
    WarnAlreadyBegin,
    /// Long transaction issued an operation before its valid epoch
    WarnPremature,
    /// Scan cursor has moved past its last entry
    WarnScanLimit,
    /// Session or scan handle is unknown
    WarnInvalidHandle,
    /// Arguments rejected
    WarnInvalidArgs,
    /// Operation not allowed for this transaction kind or state
    WarnIllegalOperation,
    /// Storage does not exist
    WarnStorageNotFound,
    /// Storage id already registered
    WarnStorageAlreadyExists,
    /// Long transaction wrote a storage it did not write-preserve
    WarnWriteWithoutWp,
    /// Commit is waiting for higher-priority long transactions
    WarnWaitingForOtherTx,
    /// Another transaction is inserting the same key
    WarnConcurrentInsert,
    /// Record stayed locked for the whole busy-wait budget
    WarnConcurrentUpdate,
    /// Session table is full
    WarnSessionLimit,
    /// Reservation array of a storage is full
    WarnWritePreserveFull,
    /// Generic concurrency-control abort
    ErrCc,
    /// Read-set validation failed
    ErrValidation,
    /// Conflict with a long transaction's write preserve
    ErrConflictOnWritePreserve,
    /// Phantom detected by node-version validation
    ErrPhantom,
    /// Read outside the declared read area
    ErrReadAreaViolation,
    /// Invariant violation
    ErrFatal,
}

impl Status {
    /// Success
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Advisory status; the transaction is still usable.
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            Status::WarnNotFound
                | Status::WarnAlreadyExists
                | Status::WarnNotBegin
                | Status::WarnAlreadyBegin
                | Status::WarnPremature
                | Status::WarnScanLimit
                | Status::WarnInvalidHandle
                | Status::WarnInvalidArgs
                | Status::WarnIllegalOperation
                | Status::WarnStorageNotFound
                | Status::WarnStorageAlreadyExists
                | Status::WarnWriteWithoutWp
                | Status::WarnWaitingForOtherTx
                | Status::WarnConcurrentInsert
                | Status::WarnConcurrentUpdate
                | Status::WarnSessionLimit
                | Status::WarnWritePreserveFull
        )
    }

    /// Hard error: the transaction was aborted (or the engine is broken).
    pub fn is_error(self) -> bool {
        !self.is_ok() && !self.is_warning()
    }

    /// Concurrency conflict that aborted the transaction.
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            Status::ErrCc
                | Status::ErrValidation
                | Status::ErrConflictOnWritePreserve
                | Status::ErrPhantom
                | Status::ErrReadAreaViolation
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AbortReason {
    /// Caller requested the abort
    UserAbort,
    /// Session left or engine shut down with the transaction running
    Shutdown,
    /// A read record changed, or is locked by another committer
    OccReadVerify,
    /// An index node changed under a captured version stamp
    OccPhantom,
    /// A long transaction's write preserve covers this short transaction
    OccWritePreserve,
    /// An updated or deleted record became a tombstone before commit
    OccWriteToDeleted,
    /// An inserted key was committed by someone else first
    OccInsertExisting,
    /// A higher-priority long transaction committed writes over our reads
    LtxReadUpperBound,
    /// A short transaction read a record at or after our valid epoch
    LtxWriteAfterOccRead,
    /// Long transaction insert hit an existing key at commit
    LtxInsertExisting,
    /// Long transaction update/delete hit a missing key at commit
    LtxWriteToMissing,
    /// Long transaction read outside its declared read area
    ReadAreaViolation,
}

impl AbortReason {
    /// Status code reported for this abort.
    pub fn status(self) -> Status {
        match self {
            AbortReason::OccReadVerify => Status::ErrValidation,
            AbortReason::OccPhantom => Status::ErrPhantom,
            AbortReason::OccWritePreserve => Status::ErrConflictOnWritePreserve,
            AbortReason::ReadAreaViolation => Status::ErrReadAreaViolation,
            _ => Status::ErrCc,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::UserAbort => "user abort",
            AbortReason::Shutdown => "session closed",
            AbortReason::OccReadVerify => "read verification failed",
            AbortReason::OccPhantom => "phantom detected",
            AbortReason::OccWritePreserve => "conflict on write preserve",
            AbortReason::OccWriteToDeleted => "write to concurrently deleted record",
            AbortReason::OccInsertExisting => "insert of concurrently committed key",
            AbortReason::LtxReadUpperBound => "read overwritten by higher-priority long transaction",
            AbortReason::LtxWriteAfterOccRead => "write under a later short-transaction read",
            AbortReason::LtxInsertExisting => "insert of existing key",
            AbortReason::LtxWriteToMissing => "update or delete of missing key",
            AbortReason::ReadAreaViolation => "read area violation",
        };
        f.write_str(text)
    }
}

/// Diagnostic record of the last abort on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultInfo {
    /// Abort reason
    pub reason: AbortReason,
    /// Storage involved, if known
    pub storage: Option<StorageId>,
    /// Key involved, if known
    pub key: Option<Vec<u8>>,
}

impl ResultInfo {
    /// Info with only a reason.
    pub fn new(reason: AbortReason) -> Self {
        ResultInfo {
            reason,
            storage: None,
            key: None,
        }
    }

    /// Attach the storage and key that triggered the abort.
    pub fn at(mut self, storage: StorageId, key: &[u8]) -> Self {
        self.storage = Some(storage);
        self.key = Some(key.to_vec());
        self
    }

    /// Attach only the storage.
    pub fn in_storage(mut self, storage: StorageId) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// Error types for the engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Key not found
    #[error("key not found")]
    NotFound,

    /// Key already exists
    #[error("key already exists")]
    AlreadyExists,

    /// No transaction has begun
    #[error("transaction not begun")]
    NotBegin,

    /// A transaction is already running on the session
    #[error("transaction already begun")]
    AlreadyBegin,

    /// Long transaction operation issued before its valid epoch
    #[error("premature: current epoch {current} is before valid epoch {valid}")]
    Premature {
        /// Current global epoch
        current: Epoch,
        /// Transaction's valid epoch
        valid: Epoch,
    },

    /// Scan cursor is past the last entry
    #[error("scan limit reached")]
    ScanLimit,

    /// Unknown session or scan handle
    #[error("invalid handle")]
    InvalidHandle,

    /// Arguments rejected
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    /// Operation not allowed for the transaction kind or state
    #[error("illegal operation `{op}` for {kind} transaction")]
    IllegalOperation {
        /// Transaction kind
        kind: TxKind,
        /// Operation name
        op: &'static str,
    },

    /// Storage does not exist
    #[error("{0} not found")]
    StorageNotFound(StorageId),

    /// Storage id already registered
    #[error("{0} already exists")]
    StorageAlreadyExists(StorageId),

    /// Storage still reserved by running long transactions
    #[error("{0} is write-preserved by a running long transaction")]
    StorageInUse(StorageId),

    /// Long transaction write to a storage outside its write preserve
    #[error("write to {0} without write preserve")]
    WriteWithoutWritePreserve(StorageId),

    /// Another transaction is inserting the same key
    #[error("concurrent insert in {0}")]
    ConcurrentInsert(StorageId),

    /// Record stayed locked for the whole busy-wait budget
    #[error("concurrent update in {0}")]
    ConcurrentUpdate(StorageId),

    /// Session table is full
    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    /// Reservation array of a storage is full
    #[error("write preserve array of {0} is full")]
    WritePreserveFull(StorageId),

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine has been shut down
    #[error("engine is shut down")]
    ShutDown,

    /// Transaction aborted by concurrency control
    #[error("transaction aborted: {0}")]
    Aborted(AbortReason),

    /// Invariant violation
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Status code of this error.
    pub fn status(&self) -> Status {
        match self {
            Error::NotFound => Status::WarnNotFound,
            Error::AlreadyExists => Status::WarnAlreadyExists,
            Error::NotBegin => Status::WarnNotBegin,
            Error::AlreadyBegin => Status::WarnAlreadyBegin,
            Error::Premature { .. } => Status::WarnPremature,
            Error::ScanLimit => Status::WarnScanLimit,
            Error::InvalidHandle => Status::WarnInvalidHandle,
            Error::InvalidArgs(_) | Error::Config(_) => Status::WarnInvalidArgs,
            Error::IllegalOperation { .. } | Error::StorageInUse(_) | Error::ShutDown => {
                Status::WarnIllegalOperation
            }
            Error::StorageNotFound(_) => Status::WarnStorageNotFound,
            Error::StorageAlreadyExists(_) => Status::WarnStorageAlreadyExists,
            Error::WriteWithoutWritePreserve(_) => Status::WarnWriteWithoutWp,
            Error::ConcurrentInsert(_) => Status::WarnConcurrentInsert,
            Error::ConcurrentUpdate(_) => Status::WarnConcurrentUpdate,
            Error::SessionLimit(_) => Status::WarnSessionLimit,
            Error::WritePreserveFull(_) => Status::WarnWritePreserveFull,
            Error::Aborted(reason) => reason.status(),
            Error::Fatal(_) => Status::ErrFatal,
        }
    }

    /// Whether the error rolled back the transaction.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Abort reason, if this is an abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Error::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Shorthand for [`Error::IllegalOperation`].
    pub fn illegal(kind: TxKind, op: &'static str) -> Self {
        Error::IllegalOperation { kind, op }
    }
}
