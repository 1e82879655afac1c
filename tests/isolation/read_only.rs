//! Read-Only Transaction Tests

use crate::common::*;
use proptest::prelude::*;

#[test]
fn snapshot_ignores_later_commits() {
    let t = TestDb::manual();
    t.put(b"k", b"old");
    t.advance(2);

    let r = t.session();
    t.db.begin(r, &TxOptions::read_only()).unwrap();
    t.put(b"k", b"new");
    t.put(b"fresh", b"v");
    t.advance(3);

    assert_eq!(t.db.search_key(r, t.st, b"k").unwrap(), b"old");
    assert!(!t.db.exist_key(r, t.st, b"fresh").unwrap());
    assert_eq!(t.db.commit(r).unwrap(), CommitStatus::Committed);
}

#[test]
fn writes_are_illegal() {
    let t = TestDb::manual();
    let r = t.session();
    t.db.begin(r, &TxOptions::read_only()).unwrap();
    for result in [
        t.db.insert(r, t.st, b"k", b"v"),
        t.db.upsert(r, t.st, b"k", b"v"),
        t.db.update(r, t.st, b"k", b"v"),
        t.db.delete_record(r, t.st, b"k"),
    ] {
        assert_eq!(result.unwrap_err().status(), Status::WarnIllegalOperation);
    }
    assert_eq!(t.db.tx_state(r).unwrap(), TxState::Active);
}

#[test]
fn read_area_on_read_only_is_rejected() {
    let t = TestDb::manual();
    let r = t.session();
    let options = TxOptions::read_only().with_read_area(ReadArea::new().allow(t.st));
    assert!(matches!(t.db.begin(r, &options), Err(Error::InvalidArgs(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn snapshot_scan_is_key_ordered(keys in prop::collection::btree_set(any::<u16>(), 1..40)) {
        let t = TestDb::manual();
        let s = t.session();
        retry_short(&t.db, s, |db| {
            for k in keys.iter().rev() {
                db.upsert(s, t.st, &k.to_be_bytes(), &encode(*k as u64))?;
            }
            Ok(())
        });
        t.advance(2);

        t.db.begin(s, &TxOptions::read_only()).unwrap();
        let h = t.db
            .open_scan(s, t.st, b"", ScanEndpoint::Inf, b"", ScanEndpoint::Inf, 0)
            .unwrap();
        prop_assert_eq!(t.db.scannable_total_index_size(s, h).unwrap(), keys.len());
        let mut seen = Vec::new();
        loop {
            let key = t.db.read_key_from_scan(s, h).unwrap();
            seen.push(u16::from_be_bytes(key.as_slice().try_into().unwrap()));
            if t.db.next_scan(s, h).is_err() {
                break;
            }
        }
        prop_assert_eq!(seen, keys.into_iter().collect::<Vec<_>>());
        t.db.commit(s).unwrap();
    }
}
