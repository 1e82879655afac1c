//! Identifiers and small value types shared by every layer

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// Name of one logical keyspace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StorageId(pub u64);

impl StorageId {
    /// Raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage#{}", self.0)
    }
}

impl From<u64> for StorageId {
    fn from(id: u64) -> Self {
        StorageId(id)
    }
}

/// Priority id of a long transaction. Lower ids began earlier and take
/// precedence in commit ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LtxId(pub u64);

impl fmt::Display for LtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ltx#{}", self.0)
    }
}

/// Transaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    /// Optimistic short transaction (STX)
    Short,
    /// Write-preserving, priority-ordered long transaction (LTX)
    Long,
    /// Snapshot read-only transaction (RTX)
    ReadOnly,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKind::Short => write!(f, "short"),
            TxKind::Long => write!(f, "long"),
            TxKind::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// Endpoint of a scan range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanEndpoint {
    /// Key itself is part of the range
    Inclusive,
    /// Key itself is excluded
    Exclusive,
    /// No bound; the key argument is ignored
    Inf,
}

impl ScanEndpoint {
    /// Turn `(key, endpoint)` into a `Bound` over owned keys.
    pub fn to_bound(self, key: &[u8]) -> Bound<Vec<u8>> {
        match self {
            ScanEndpoint::Inclusive => Bound::Included(key.to_vec()),
            ScanEndpoint::Exclusive => Bound::Excluded(key.to_vec()),
            ScanEndpoint::Inf => Bound::Unbounded,
        }
    }
}

/// A contiguous range of keys.
///
/// Long transactions record the ranges they read; concluded long
/// transactions publish the range they wrote. Overlap between the two
/// decides whether a forwarding dependency invalidated a read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    /// Lower bound
    pub lower: Bound<Vec<u8>>,
    /// Upper bound
    pub upper: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Range covering every key.
    pub fn full() -> Self {
        KeyRange {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Range covering exactly `key`.
    pub fn point(key: &[u8]) -> Self {
        KeyRange {
            lower: Bound::Included(key.to_vec()),
            upper: Bound::Included(key.to_vec()),
        }
    }

    /// Closed range `[lower, upper]`.
    pub fn closed(lower: &[u8], upper: &[u8]) -> Self {
        KeyRange {
            lower: Bound::Included(lower.to_vec()),
            upper: Bound::Included(upper.to_vec()),
        }
    }

    /// Range described by scan arguments.
    pub fn from_scan(
        lower: &[u8],
        lower_endpoint: ScanEndpoint,
        upper: &[u8],
        upper_endpoint: ScanEndpoint,
    ) -> Self {
        KeyRange {
            lower: lower_endpoint.to_bound(lower),
            upper: upper_endpoint.to_bound(upper),
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_lower = match &self.lower {
            Bound::Included(l) => key >= l.as_slice(),
            Bound::Excluded(l) => key > l.as_slice(),
            Bound::Unbounded => true,
        };
        let below_upper = match &self.upper {
            Bound::Included(u) => key <= u.as_slice(),
            Bound::Excluded(u) => key < u.as_slice(),
            Bound::Unbounded => true,
        };
        above_lower && below_upper
    }

    /// Whether the range can contain no key at all.
    pub fn is_empty(&self) -> bool {
        !lower_reaches_upper(&self.lower, &self.upper)
    }

    /// Whether two ranges share at least one key (conservative for
    /// adjacent exclusive bounds).
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && lower_reaches_upper(&self.lower, &other.upper)
            && lower_reaches_upper(&other.lower, &self.upper)
    }

    /// Grow the range so it also covers `key`.
    pub fn extend_to(&mut self, key: &[u8]) {
        let lower_ok = match &self.lower {
            Bound::Included(l) => key >= l.as_slice(),
            Bound::Excluded(l) => key > l.as_slice(),
            Bound::Unbounded => true,
        };
        if !lower_ok {
            self.lower = Bound::Included(key.to_vec());
        }
        let upper_ok = match &self.upper {
            Bound::Included(u) => key <= u.as_slice(),
            Bound::Excluded(u) => key < u.as_slice(),
            Bound::Unbounded => true,
        };
        if !upper_ok {
            self.upper = Bound::Included(key.to_vec());
        }
    }
}

fn lower_reaches_upper(lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Included(l), Bound::Included(u)) => l.cmp(u) != Ordering::Greater,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l < u,
    }
}
