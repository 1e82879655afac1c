//! Short Transaction Tests
//!
//! - read validation and write skew
//! - insert / update / delete preconditions
//! - lifecycle of a session

use crate::common::*;

// ============================================================================
// Validation
// ============================================================================

#[test]
fn write_skew_is_prevented() {
    let t = TestDb::manual();
    t.put(b"a", &encode(50));
    t.put(b"b", &encode(50));

    let s1 = t.session();
    let s2 = t.session();
    for s in [s1, s2] {
        t.db.begin(s, &TxOptions::short()).unwrap();
        let sum = decode(&t.db.search_key(s, t.st, b"a").unwrap())
            + decode(&t.db.search_key(s, t.st, b"b").unwrap());
        assert_eq!(sum, 100);
    }
    t.db.update(s1, t.st, b"a", &encode(0)).unwrap();
    t.db.update(s2, t.st, b"b", &encode(0)).unwrap();

    assert_eq!(t.db.commit(s1).unwrap(), CommitStatus::Committed);
    let err = t.db.commit(s2).unwrap_err();
    assert_eq!(err.status(), Status::ErrValidation);
    assert_eq!(t.get(b"b"), Some(encode(50).to_vec()));
}

#[test]
fn blind_writes_do_not_conflict() {
    let t = TestDb::manual();
    t.put(b"k", b"zero");
    let s1 = t.session();
    let s2 = t.session();
    for (s, v) in [(s1, b"one"), (s2, b"two")] {
        t.db.begin(s, &TxOptions::short()).unwrap();
        t.db.upsert(s, t.st, b"k", v).unwrap();
    }
    t.db.commit(s1).unwrap();
    t.db.commit(s2).unwrap();
    assert_eq!(t.get(b"k").as_deref(), Some(&b"two"[..]));
}

#[test]
fn absent_read_is_validated() {
    let t = TestDb::manual();
    let s = t.session();
    t.db.begin(s, &TxOptions::short()).unwrap();
    assert!(!t.db.exist_key(s, t.st, b"ghost").unwrap());
    t.db.upsert(s, t.st, b"marker", b"saw nothing").unwrap();

    t.put(b"ghost", b"boo");
    assert!(t.db.commit(s).unwrap_err().status().is_conflict());
    assert_eq!(t.get(b"marker"), None);
}

// ============================================================================
// Write preconditions
// ============================================================================

#[test]
fn insert_update_delete_preconditions() {
    let t = TestDb::manual();
    t.put(b"present", b"v");
    let s = t.session();

    t.db.begin(s, &TxOptions::short()).unwrap();
    assert_eq!(t.db.insert(s, t.st, b"present", b"x"), Err(Error::AlreadyExists));
    assert_eq!(t.db.update(s, t.st, b"missing", b"x"), Err(Error::NotFound));
    assert_eq!(t.db.delete_record(s, t.st, b"missing"), Err(Error::NotFound));
    assert_eq!(t.db.tx_state(s).unwrap(), TxState::Active);
    t.db.commit(s).unwrap();
}

#[test]
fn writes_are_visible_to_their_own_transaction_only() {
    let t = TestDb::manual();
    let s = t.session();
    t.db.begin(s, &TxOptions::short()).unwrap();
    t.db.insert(s, t.st, b"k", b"mine").unwrap();
    t.db.update(s, t.st, b"k", b"still mine").unwrap();
    assert_eq!(t.db.search_key(s, t.st, b"k").unwrap(), b"still mine");
    assert_eq!(t.get(b"k"), None);
    t.db.abort(s).unwrap();
    assert_eq!(t.get(b"k"), None);
}

#[test]
fn unknown_storage_is_reported() {
    let t = TestDb::manual();
    let s = t.session();
    t.db.begin(s, &TxOptions::short()).unwrap();
    assert_eq!(
        t.db.search_key(s, StorageId(9_999), b"k"),
        Err(Error::StorageNotFound(StorageId(9_999)))
    );
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[test]
fn session_states_follow_the_transaction() {
    let t = TestDb::manual();
    let s = t.session();
    assert_eq!(t.db.tx_state(s).unwrap(), TxState::Inactive);
    assert_eq!(t.db.commit(s), Err(Error::NotBegin));

    t.db.begin(s, &TxOptions::short()).unwrap();
    assert_eq!(t.db.tx_state(s).unwrap(), TxState::Active);
    assert_eq!(t.db.begin(s, &TxOptions::short()), Err(Error::AlreadyBegin));
    t.db.commit(s).unwrap();
    assert_eq!(t.db.tx_state(s).unwrap(), TxState::Durable);

    t.db.begin(s, &TxOptions::short()).unwrap();
    t.db.abort(s).unwrap();
    assert_eq!(t.db.tx_state(s).unwrap(), TxState::Aborted);
    assert_eq!(t.db.result_info(s).unwrap().unwrap().reason, AbortReason::UserAbort);

    t.db.leave(s).unwrap();
    assert_eq!(t.db.tx_state(s), Err(Error::InvalidHandle));
}

#[test]
fn session_limit_is_enforced() {
    let db = Database::builder().manual_epochs().max_sessions(2).open().unwrap();
    let a = db.enter().unwrap();
    let _b = db.enter().unwrap();
    assert_eq!(db.enter().unwrap_err().status(), Status::WarnSessionLimit);
    db.leave(a).unwrap();
    assert!(db.enter().is_ok());
}
