//! Transaction Performance Benchmarks
//!
//! Measures throughput of the three transaction kinds:
//! - short transactions, single-threaded and contended
//! - long transactions writing a reserved storage
//! - read-only snapshot reads and scans

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use epochkv_engine::{CommitStatus, Database, ScanEndpoint, SessionId, StorageId, TxOptions};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn open_manual() -> (Arc<Database>, StorageId) {
    let db = Database::builder().manual_epochs().open().unwrap();
    let st = db.create_storage(None).unwrap();
    (db, st)
}

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

/// Run `body` in one short transaction, retrying on abort.
fn short_tx(db: &Database, sid: SessionId, mut body: impl FnMut() -> epochkv_engine::Result<()>) -> usize {
    let mut aborts = 0;
    loop {
        db.begin(sid, &TxOptions::short()).unwrap();
        match body().and_then(|()| db.commit(sid)) {
            Ok(CommitStatus::Committed) => return aborts,
            Ok(other) => panic!("unexpected commit status {:?}", other),
            Err(e) if e.is_abort() => aborts += 1,
            Err(_) => {
                let _ = db.abort(sid);
                aborts += 1;
            }
        }
    }
}

fn populate(db: &Database, st: StorageId, n: u64) {
    let sid = db.enter().unwrap();
    for chunk in (0..n).collect::<Vec<_>>().chunks(100) {
        short_tx(db, sid, || {
            for &i in chunk {
                db.upsert(sid, st, &key(i), &i.to_le_bytes())?;
            }
            Ok(())
        });
    }
    db.leave(sid).unwrap();
}

/// Benchmark: Single-threaded short transactions (no contention)
fn bench_single_threaded_short(c: &mut Criterion) {
    let (db, st) = open_manual();
    let sid = db.enter().unwrap();

    let mut group = c.benchmark_group("short_single_threaded");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert", |b| {
        let mut i = 0u64;
        b.iter(|| {
            short_tx(&db, sid, || db.insert(sid, st, &key(i), b"value"));
            i += 1;
        });
    });

    group.bench_function("read_modify_write", |b| {
        short_tx(&db, sid, || db.upsert(sid, st, b"counter", &0u64.to_le_bytes()));
        b.iter(|| {
            short_tx(&db, sid, || {
                let n = u64::from_le_bytes(db.search_key(sid, st, b"counter")?.try_into().unwrap_or([0; 8]));
                db.update(sid, st, b"counter", &(n + 1).to_le_bytes())
            });
        });
    });

    group.bench_function("insert_delete_churn", |b| {
        let mut epoch_tick = 0u32;
        b.iter(|| {
            short_tx(&db, sid, || db.upsert(sid, st, b"churn", b"v"));
            short_tx(&db, sid, || db.delete_record(sid, st, b"churn"));
            epoch_tick += 1;
            if epoch_tick % 64 == 0 {
                db.advance_epoch();
            }
        });
    });

    group.finish();
}

/// Benchmark: Multi-threaded short transactions, disjoint and contended keys
fn bench_multi_threaded_short(c: &mut Criterion) {
    let mut group = c.benchmark_group("short_multi_threaded");

    for (label, contended) in [("no_conflict", false), ("with_conflict", true)] {
        for num_threads in [2u64, 4] {
            group.throughput(Throughput::Elements(num_threads));
            group.bench_with_input(
                BenchmarkId::new(label, num_threads),
                &num_threads,
                |b, &num_threads| {
                    b.iter_custom(|iters| {
                        let db = Database::builder()
                            .epoch_duration(Duration::from_millis(10))
                            .open()
                            .unwrap();
                        let st = db.create_storage(None).unwrap();
                        populate(&db, st, num_threads);

                        let start = std::time::Instant::now();
                        let handles: Vec<_> = (0..num_threads)
                            .map(|t| {
                                let db = Arc::clone(&db);
                                thread::spawn(move || {
                                    let sid = db.enter().unwrap();
                                    let k = if contended { key(0) } else { key(t) };
                                    for _ in 0..iters {
                                        short_tx(&db, sid, || {
                                            let v = db.search_key(sid, st, &k)?;
                                            db.update(sid, st, &k, &v)
                                        });
                                    }
                                    db.leave(sid).unwrap();
                                })
                            })
                            .collect();
                        for h in handles {
                            h.join().unwrap();
                        }
                        start.elapsed()
                    });
                },
            );
        }
    }

    group.finish();
}

/// Benchmark: Long transactions writing a reserved storage
fn bench_long_transactions(c: &mut Criterion) {
    let (db, st) = open_manual();
    let sid = db.enter().unwrap();

    let mut group = c.benchmark_group("long");
    for batch in [1u64, 100] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("write_batch", batch), &batch, |b, &batch| {
            b.iter(|| {
                db.begin(sid, &TxOptions::long([st])).unwrap();
                db.advance_epoch();
                for i in 0..batch {
                    db.upsert(sid, st, &key(i), b"long").unwrap();
                }
                black_box(db.commit(sid).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark: Read-only snapshot transactions
fn bench_read_only(c: &mut Criterion) {
    let (db, st) = open_manual();
    populate(&db, st, 1000);
    db.advance_epoch();
    db.advance_epoch();
    let sid = db.enter().unwrap();

    let mut group = c.benchmark_group("read_only");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_read", |b| {
        b.iter(|| {
            db.begin(sid, &TxOptions::read_only()).unwrap();
            black_box(db.search_key(sid, st, &key(500)).unwrap());
            db.commit(sid).unwrap();
        });
    });

    group.bench_function("scan_100", |b| {
        b.iter(|| {
            db.begin(sid, &TxOptions::read_only()).unwrap();
            let h = db
                .open_scan(sid, st, &key(100), ScanEndpoint::Inclusive, &key(200), ScanEndpoint::Exclusive, 0)
                .unwrap();
            while db.next_scan(sid, h).is_ok() {
                black_box(db.read_value_from_scan(sid, h).unwrap());
            }
            db.commit(sid).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_threaded_short,
    bench_multi_threaded_short,
    bench_long_transactions,
    bench_read_only,
);

criterion_main!(benches);
