//! Ordered key index with node-version stamps
//!
//! The index maps keys to records in key order. Phantom detection needs a
//! structural version that changes whenever a key appears in or disappears
//! from a region a reader looked at, so every key carries a *gap stamp*
//! covering the open interval between it and the next key, and the index
//! carries one more stamp for the interval before its first key.
//!
//! - Inserting key `k` bumps the gap stamp of `k`'s predecessor.
//! - Removing key `k` bumps the predecessor's gap stamp and `k`'s own.
//!
//! A reader that captured the stamps of every gap its range touched can
//! re-check them at commit; any insert or removal in the range changes at
//! least one.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use epochkv_core::KeyRange;
use parking_lot::RwLock;

use crate::record::Record;

/// Structural version counter of one index gap.
#[derive(Debug, Default)]
pub struct NodeStamp(AtomicU64);

impl NodeStamp {
    fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn bump(&self) -> (u64, u64) {
        let before = self.0.fetch_add(1, Ordering::AcqRel);
        (before, before + 1)
    }
}

/// A captured `(stamp, value)` pair.
#[derive(Debug, Clone)]
pub struct NodeVersion {
    node: Arc<NodeStamp>,
    observed: u64,
}

impl NodeVersion {
    fn capture(node: &Arc<NodeStamp>) -> Self {
        NodeVersion {
            node: Arc::clone(node),
            observed: node.load(),
        }
    }

    /// Whether the gap is unchanged since capture.
    pub fn is_current(&self) -> bool {
        self.node.load() == self.observed
    }

    /// Account for a structural change the capturing transaction made
    /// itself: if the stamp moved from exactly `change.before` to
    /// `change.after`, adopt the new value.
    pub fn absorb(&mut self, change: &NodeChange) {
        if Arc::ptr_eq(&self.node, &change.node) && self.observed == change.before {
            self.observed = change.after;
        }
    }

    /// Whether both refer to the same gap.
    pub fn same_node(&self, other: &NodeVersion) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

/// A stamp change caused by an insert.
#[derive(Debug, Clone)]
pub struct NodeChange {
    node: Arc<NodeStamp>,
    before: u64,
    after: u64,
}

/// Outcome of a point lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Key is present
    Found(Arc<Record>),
    /// Key is absent; the stamp of the gap it would fall into
    Missing(NodeVersion),
}

/// Result of a range scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Matching records in ascending key order
    pub entries: Vec<Arc<Record>>,
    /// Stamps of every gap the scanned range touches
    pub nodes: Vec<NodeVersion>,
}

#[derive(Debug)]
struct Slot {
    record: Arc<Record>,
    gap: Arc<NodeStamp>,
}

#[derive(Debug, Default)]
struct IndexInner {
    entries: BTreeMap<Vec<u8>, Slot>,
    head_gap: Arc<NodeStamp>,
}

impl IndexInner {
    /// Gap owned by the greatest key below `key` (or at `key` when
    /// `inclusive`), falling back to the head gap.
    fn gap_before(&self, key: &[u8], inclusive: bool) -> &Arc<NodeStamp> {
        let upper = if inclusive {
            Bound::Included(key)
        } else {
            Bound::Excluded(key)
        };
        self.entries
            .range::<[u8], _>((Bound::Unbounded, upper))
            .next_back()
            .map(|(_, slot)| &slot.gap)
            .unwrap_or(&self.head_gap)
    }
}

/// Ordered map from keys to records.
#[derive(Debug, Default)]
pub struct OrderedIndex {
    inner: RwLock<IndexInner>,
}

impl OrderedIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Arc<Record>> {
        self.inner.read().entries.get(key).map(|s| Arc::clone(&s.record))
    }

    /// Point lookup that also captures the gap stamp on a miss.
    pub fn lookup(&self, key: &[u8]) -> Lookup {
        let inner = self.inner.read();
        match inner.entries.get(key) {
            Some(slot) => Lookup::Found(Arc::clone(&slot.record)),
            None => Lookup::Missing(NodeVersion::capture(inner.gap_before(key, false))),
        }
    }

    /// Insert `record` under its key unless the key is taken.
    ///
    /// On success returns the stamp change of the gap the key landed in, so
    /// the inserter can absorb its own structural change. On failure
    /// returns the record already present.
    pub fn insert_if_absent(&self, record: Arc<Record>) -> Result<NodeChange, Arc<Record>> {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.entries.get(record.key()) {
            return Err(Arc::clone(&slot.record));
        }
        let gap = Arc::clone(inner.gap_before(record.key(), false));
        let (before, after) = gap.bump();
        inner.entries.insert(
            record.key().to_vec(),
            Slot {
                record,
                gap: Arc::new(NodeStamp::default()),
            },
        );
        Ok(NodeChange {
            node: gap,
            before,
            after,
        })
    }

    /// Remove `key` if it still maps to `record`.
    pub fn remove(&self, key: &[u8], record: &Arc<Record>) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.get(key) {
            Some(slot) if Arc::ptr_eq(&slot.record, record) => {}
            _ => return false,
        }
        let Some(slot) = inner.entries.remove(key) else {
            return false;
        };
        slot.gap.bump();
        inner.gap_before(key, false).bump();
        true
    }

    /// Records inside `range` in ascending key order, at most `max` of them
    /// (`0` = unlimited), plus the gap stamps covering the scanned region.
    pub fn scan(&self, range: &KeyRange, max: usize) -> ScanResult {
        let inner = self.inner.read();
        let mut result = ScanResult::default();
        if range.is_empty() {
            return result;
        }

        let first_gap = match &range.lower {
            Bound::Included(l) => inner.gap_before(l, false),
            Bound::Excluded(l) => inner.gap_before(l, true),
            Bound::Unbounded => &inner.head_gap,
        };
        result.nodes.push(NodeVersion::capture(first_gap));

        let bounds = (range.lower.as_ref(), range.upper.as_ref());
        for (_, slot) in inner
            .entries
            .range::<Vec<u8>, (Bound<&Vec<u8>>, Bound<&Vec<u8>>)>(bounds)
        {
            if max != 0 && result.entries.len() == max {
                break;
            }
            result.entries.push(Arc::clone(&slot.record));
            result.nodes.push(NodeVersion::capture(&slot.gap));
        }
        result
    }

    /// Snapshot of every record, in key order.
    pub fn records(&self) -> Vec<Arc<Record>> {
        self.inner
            .read()
            .entries
            .values()
            .map(|s| Arc::clone(&s.record))
            .collect()
    }

    /// Number of keys (live, inserting, or tombstoned).
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the index holds no key.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochkv_core::ScanEndpoint;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn add(index: &OrderedIndex, key: &[u8]) -> Arc<Record> {
        let rec = Arc::new(Record::inserting(key));
        index.insert_if_absent(Arc::clone(&rec)).unwrap();
        rec
    }

    fn keys(result: &ScanResult) -> Vec<Vec<u8>> {
        result.entries.iter().map(|r| r.key().to_vec()).collect()
    }

    #[test]
    fn insert_rejects_duplicates() {
        let index = OrderedIndex::new();
        let first = add(&index, b"a");
        let dup = Arc::new(Record::inserting(b"a"));
        let existing = index.insert_if_absent(dup).unwrap_err();
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn scan_is_ordered_and_bounded() {
        let index = OrderedIndex::new();
        for k in [b"d", b"a", b"c", b"b", b"e"] {
            add(&index, k);
        }
        let range = KeyRange::from_scan(b"b", ScanEndpoint::Inclusive, b"d", ScanEndpoint::Exclusive);
        let result = index.scan(&range, 0);
        assert_eq!(keys(&result), vec![b"b".to_vec(), b"c".to_vec()]);

        let limited = index.scan(&KeyRange::full(), 3);
        assert_eq!(limited.entries.len(), 3);
        assert_eq!(limited.nodes.len(), 4);
    }

    #[test]
    fn empty_and_inverted_ranges_do_not_panic() {
        let index = OrderedIndex::new();
        add(&index, b"m");
        let inverted = KeyRange::closed(b"z", b"a");
        assert!(index.scan(&inverted, 0).entries.is_empty());
        let same_excluded =
            KeyRange::from_scan(b"m", ScanEndpoint::Exclusive, b"m", ScanEndpoint::Exclusive);
        assert!(index.scan(&same_excluded, 0).entries.is_empty());
    }

    #[test]
    fn insert_into_scanned_gap_invalidates_stamp() {
        let index = OrderedIndex::new();
        add(&index, b"a");
        add(&index, b"z");
        let range = KeyRange::closed(b"b", b"y");
        let result = index.scan(&range, 0);
        assert!(result.entries.is_empty());
        assert!(result.nodes.iter().all(NodeVersion::is_current));

        add(&index, b"m");
        assert!(!result.nodes.iter().all(NodeVersion::is_current));
    }

    #[test]
    fn insert_outside_range_keeps_stamps() {
        let index = OrderedIndex::new();
        add(&index, b"c");
        add(&index, b"f");
        let result = index.scan(&KeyRange::closed(b"c", b"d"), 0);
        add(&index, b"a");
        add(&index, b"x");
        assert!(result.nodes.iter().all(NodeVersion::is_current));
    }

    #[test]
    fn missing_lookup_tracks_its_gap() {
        let index = OrderedIndex::new();
        add(&index, b"a");
        let Lookup::Missing(node) = index.lookup(b"k") else {
            panic!("expected miss");
        };
        assert!(node.is_current());
        add(&index, b"k");
        assert!(!node.is_current());
    }

    #[test]
    fn own_insert_is_absorbed() {
        let index = OrderedIndex::new();
        let Lookup::Missing(mut node) = index.lookup(b"k") else {
            panic!("expected miss");
        };
        let change = index
            .insert_if_absent(Arc::new(Record::inserting(b"k")))
            .unwrap();
        assert!(!node.is_current());
        node.absorb(&change);
        assert!(node.is_current());
    }

    #[test]
    fn remove_requires_same_record_and_bumps_stamps() {
        let index = OrderedIndex::new();
        let rec = add(&index, b"k");
        let stranger = Arc::new(Record::inserting(b"k"));
        assert!(!index.remove(b"k", &stranger));

        let before = index.scan(&KeyRange::full(), 0);
        assert!(index.remove(b"k", &rec));
        assert!(index.get(b"k").is_none());
        assert!(!before.nodes.iter().all(NodeVersion::is_current));
    }

    proptest! {
        #[test]
        fn scan_matches_btreeset_model(
            inserted in proptest::collection::vec(proptest::collection::vec(0u8..8, 1..3), 0..40),
            lo in proptest::collection::vec(0u8..8, 1..3),
            hi in proptest::collection::vec(0u8..8, 1..3),
            lo_ep in 0usize..3,
            hi_ep in 0usize..3,
        ) {
            let endpoints = [ScanEndpoint::Inclusive, ScanEndpoint::Exclusive, ScanEndpoint::Inf];
            let index = OrderedIndex::new();
            let mut model = BTreeSet::new();
            for k in &inserted {
                let fresh = index.insert_if_absent(Arc::new(Record::inserting(k))).is_ok();
                prop_assert_eq!(fresh, model.insert(k.clone()));
            }
            let range = KeyRange::from_scan(&lo, endpoints[lo_ep], &hi, endpoints[hi_ep]);
            let expected: Vec<Vec<u8>> = model.iter().filter(|k| range.contains(k)).cloned().collect();
            let got = index.scan(&range, 0);
            prop_assert_eq!(keys(&got), expected);
        }
    }
}
