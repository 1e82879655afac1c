//! Stress Tests
//!
//! Many sessions against a background-ticking engine.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::common::*;

#[test]
fn counters_survive_contention_and_gc() {
    let t = TestDb::ticking();
    const THREADS: u64 = 6;
    const INCREMENTS: u64 = 150;
    t.put(b"counter", &encode(0));

    let db = Arc::clone(&t.db);
    let st = t.st;
    let aborts = Arc::new(Mutex::new(0u64));
    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let db = Arc::clone(&db);
            let aborts = Arc::clone(&aborts);
            thread::spawn(move || {
                let sid = db.enter().unwrap();
                for i in 0..INCREMENTS {
                    let mut attempts = 0u64;
                    retry_short(&db, sid, |db| {
                        attempts += 1;
                        let n = decode(&db.search_key(sid, st, b"counter")?);
                        db.update(sid, st, b"counter", &encode(n + 1))?;
                        // scratch keys churn through insert and delete
                        let scratch = format!("scratch-{id}-{}", i % 4);
                        match db.delete_record(sid, st, scratch.as_bytes()) {
                            Err(Error::NotFound) => db.insert(sid, st, scratch.as_bytes(), b"x"),
                            other => other,
                        }
                    });
                    *aborts.lock() += attempts - 1;
                }
                db.leave(sid).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(decode(&t.get(b"counter").unwrap()), THREADS * INCREMENTS);
    let metrics = t.db.metrics();
    assert_eq!(metrics.short.aborted, *aborts.lock());
}

#[test]
fn long_and_short_writers_share_an_engine() {
    let t = TestDb::ticking();
    let hot = t.st;
    let cold = t.db.create_storage(None).unwrap();
    t.put(b"seed", b"v");

    let db = Arc::clone(&t.db);
    let short_writer = thread::spawn(move || {
        let sid = db.enter().unwrap();
        for i in 0..200u32 {
            retry_short(&db, sid, |db| db.upsert(sid, cold, &i.to_be_bytes(), b"short"));
        }
        db.leave(sid).unwrap();
    });

    let sid = t.session();
    for round in 0..5u32 {
        t.db.begin(sid, &TxOptions::long([hot])).unwrap();
        loop {
            match t.db.upsert(sid, hot, &round.to_be_bytes(), b"long") {
                Ok(()) => break,
                Err(Error::Premature { .. }) => thread::yield_now(),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(t.db.commit(sid).unwrap(), CommitStatus::Committed);
    }
    short_writer.join().unwrap();

    let s = t.session();
    retry_short(&t.db, s, |db| {
        for round in 0..5u32 {
            assert_eq!(db.search_key(s, hot, &round.to_be_bytes())?, b"long");
        }
        for i in 0..200u32 {
            assert_eq!(db.search_key(s, cold, &i.to_be_bytes())?, b"short");
        }
        Ok(())
    });
}
