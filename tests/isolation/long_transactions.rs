//! Long Transaction Tests
//!
//! - the valid epoch gates every operation
//! - write preserve reservations against short writers
//! - priority ordering between long transactions

use crate::common::*;

#[test]
fn operations_wait_for_the_valid_epoch() {
    let t = TestDb::manual();
    let s = t.begin_long(&[t.st]);
    assert!(matches!(
        t.db.upsert(s, t.st, b"k", b"v"),
        Err(Error::Premature { .. })
    ));
    assert!(matches!(t.db.commit(s), Err(Error::Premature { .. })));
    assert_eq!(t.db.tx_state(s).unwrap(), TxState::Active);

    t.advance(1);
    t.db.upsert(s, t.st, b"k", b"v").unwrap();
    assert_eq!(t.db.commit(s).unwrap(), CommitStatus::Committed);
    assert_eq!(t.get(b"k").as_deref(), Some(&b"v"[..]));
}

#[test]
fn reservation_applies_from_the_valid_epoch_on() {
    let t = TestDb::manual();
    let l = t.begin_long(&[t.st]);

    // still the begin epoch: short writers commit normally
    t.put(b"early", b"v");

    t.advance(1);
    let s = t.session();
    t.db.begin(s, &TxOptions::short()).unwrap();
    assert_eq!(
        t.db.upsert(s, t.st, b"late", b"v").unwrap_err().status(),
        Status::ErrConflictOnWritePreserve
    );

    t.db.abort(l).unwrap();
    t.put(b"late", b"v");
    assert_eq!(t.get(b"late").as_deref(), Some(&b"v"[..]));
}

#[test]
fn long_reads_see_state_before_the_valid_epoch() {
    let t = TestDb::manual();
    t.put(b"k", b"before");
    let l = t.begin_long(&[t.st]);
    t.advance(1);

    assert_eq!(t.db.search_key(l, t.st, b"k").unwrap(), b"before");
    t.db.update(l, t.st, b"k", b"after").unwrap();
    assert_eq!(t.db.search_key(l, t.st, b"k").unwrap(), b"after");
    t.db.commit(l).unwrap();
    assert_eq!(t.get(b"k").as_deref(), Some(&b"after"[..]));
}

#[test]
fn unreserved_storage_is_read_only_for_long_transactions() {
    let t = TestDb::manual();
    let other = t.db.create_storage(None).unwrap();
    let l = t.begin_long(&[t.st]);
    t.advance(1);
    assert_eq!(
        t.db.upsert(l, other, b"k", b"v"),
        Err(Error::WriteWithoutWritePreserve(other))
    );
    assert_eq!(t.db.tx_state(l).unwrap(), TxState::Active);
    t.db.commit(l).unwrap();
}

#[test]
fn forbidden_storage_read_aborts() {
    let t = TestDb::manual();
    let secret = t.db.create_storage(None).unwrap();
    let s = t.session();
    t.db.begin(
        s,
        &TxOptions::long([t.st]).with_read_area(ReadArea::new().forbid(secret)),
    )
    .unwrap();
    t.advance(1);

    assert_eq!(
        t.db.search_key(s, secret, b"k").unwrap_err().status(),
        Status::ErrReadAreaViolation
    );
    assert_eq!(t.db.tx_state(s).unwrap(), TxState::Aborted);
}

#[test]
fn three_writers_serialize_in_begin_order() {
    let t = TestDb::manual();
    let first = t.begin_long(&[t.st]);
    let second = t.begin_long(&[t.st]);
    let third = t.begin_long(&[t.st]);
    t.advance(1);

    for (s, v) in [(third, &b"3"[..]), (second, b"2"), (first, b"1")] {
        t.db.upsert(s, t.st, b"k", v).unwrap();
    }
    assert_eq!(t.db.commit(third).unwrap(), CommitStatus::WaitingForOtherTx);
    assert_eq!(t.db.commit(second).unwrap(), CommitStatus::WaitingForOtherTx);
    assert_eq!(t.db.commit(first).unwrap(), CommitStatus::Committed);
    assert_eq!(t.db.check_commit(third).unwrap(), CommitStatus::WaitingForOtherTx);
    assert_eq!(t.db.check_commit(second).unwrap(), CommitStatus::Committed);
    assert_eq!(t.db.check_commit(third).unwrap(), CommitStatus::Committed);

    assert_eq!(t.get(b"k").as_deref(), Some(&b"3"[..]));
}

#[test]
fn reserved_storage_cannot_be_deleted() {
    let t = TestDb::manual();
    let l = t.begin_long(&[t.st]);
    assert_eq!(t.db.delete_storage(t.st), Err(Error::StorageInUse(t.st)));
    t.db.abort(l).unwrap();
    t.db.delete_storage(t.st).unwrap();
    assert!(!t.db.exist_storage(t.st));
}
