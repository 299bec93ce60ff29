use rand::prelude::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

mod common;
use common::{scaled, threads, with_sound_table, with_table};

// Readers look up a fixed set of keys that is never removed, while writers add and remove
// their own disjoint ranges.
#[test]
fn lookup_during_del() {
    const STABLE: u64 = 64;
    let rounds = scaled(1 << 10);

    with_sound_table(|table| {
        let table = table();
        for k in 0..STABLE {
            table.add(k, k * 2).unwrap();
        }

        let writers = (threads() / 2).max(1);
        let readers = threads().max(2);
        let barrier = Barrier::new(writers + readers);
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            for w in 0..writers {
                let (table, barrier) = (&table, &barrier);
                s.spawn(move || {
                    table.register_thread();
                    barrier.wait();

                    let base = STABLE + (w as u64) * 1_000_000;
                    for i in 0..rounds as u64 {
                        table.add(base + i, i).unwrap();
                        assert_eq!(table.lookup(base + i), Some(i));
                        table.del(base + i).unwrap();
                    }

                    table.unregister_thread();
                });
            }

            for _ in 0..readers {
                let (table, barrier, done) = (&table, &barrier, &done);
                s.spawn(move || {
                    table.register_thread();
                    barrier.wait();

                    let mut rng = rand::thread_rng();
                    let mut lookups = 0;
                    while !done.load(Ordering::Relaxed) || lookups < STABLE {
                        let k = rng.gen_range(0..STABLE);
                        assert_eq!(table.lookup(k), Some(k * 2));
                        lookups += 1;
                    }

                    table.unregister_thread();
                    debug!("reader finished after {lookups} lookups");
                });
            }

            // stop the readers once the writers are finished
            s.spawn(|| {
                while table.len() > STABLE as usize
                    || table.stats().allocated < STABLE as usize + writers * rounds
                {
                    thread::yield_now();
                }
                done.store(true, Ordering::Relaxed);
            });
        });

        // every removed entry was freed once all threads unregistered
        table.quiescent_state();
        let stats = table.stats();
        assert_eq!(stats.live(), table.len());
        assert_eq!(table.len(), STABLE as usize);
    });
}

// add(10, 100), add(20, 200), then remove 10 while other threads look up both keys.
#[test]
fn del_races_lookup() {
    let iterations = scaled(1 << 8);

    with_sound_table(|table| {
        for _ in 0..iterations {
            let table = table();
            table.add(10, 100).unwrap();
            table.add(20, 200).unwrap();

            let barrier = Barrier::new(3);

            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    table.del(10).unwrap();
                    table.unregister_thread();
                });

                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..64 {
                        let value = table.lookup(10);
                        assert!(matches!(value, Some(100) | None), "{value:?}");
                    }
                    table.unregister_thread();
                });

                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..64 {
                        assert_eq!(table.lookup(20), Some(200));
                    }
                    table.unregister_thread();
                });
            });

            assert_eq!(table.lookup(10), None);
            table.quiescent_state();
            assert_eq!(table.stats().live(), 1);
        }
    });
}

// Readers race repeated clears. Keys always map to the same value, so a lookup either
// finds it or does not.
#[test]
fn lookup_during_clear() {
    const ENTRIES: u64 = 128;
    let rounds = scaled(1 << 8);

    with_sound_table(|table| {
        let table = table();
        let readers = threads().max(2);
        let barrier = Barrier::new(readers + 1);
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..rounds {
                    for k in 0..ENTRIES {
                        table.add(k, !k).unwrap();
                    }
                    table.clear();
                }
                table.unregister_thread();
                done.store(true, Ordering::Relaxed);
            });

            for _ in 0..readers {
                s.spawn(|| {
                    barrier.wait();
                    let mut rng = rand::thread_rng();
                    while !done.load(Ordering::Relaxed) {
                        let k = rng.gen_range(0..ENTRIES);
                        if let Some(v) = table.lookup(k) {
                            assert_eq!(v, !k);
                        }
                    }
                    table.unregister_thread();
                });
            }
        });

        table.quiescent_state();
        assert_eq!(table.len(), 0);
        assert_eq!(table.stats().live(), 0);
        assert_eq!(table.stats().allocated, rounds * ENTRIES as usize);
    });
}

// Writers only add, so every strategy is safe to run concurrently here.
#[test]
fn lookup_during_add() {
    let entries = scaled(1 << 10) as u64;

    with_table(|table| {
        let table = table();
        let writers = (threads() / 2).max(1);
        let barrier = Barrier::new(writers * 2);

        thread::scope(|s| {
            for w in 0..writers as u64 {
                let (table, barrier) = (&table, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..entries {
                        let key = w * entries + i;
                        table.add(key, key + 1).unwrap();
                    }
                });

                s.spawn(move || {
                    barrier.wait();
                    let mut rng = rand::thread_rng();
                    for _ in 0..entries {
                        let key = w * entries + rng.gen_range(0..entries);
                        if let Some(v) = table.lookup(key) {
                            assert_eq!(v, key + 1);
                        }
                    }
                });
            }
        });

        assert_eq!(table.len(), writers * entries as usize);
        for key in 0..writers as u64 * entries {
            assert_eq!(table.lookup(key), Some(key + 1));
        }
    });
}

// Concurrent writers on disjoint keys, with no readers.
#[test]
fn add_del_stress() {
    let entries = scaled(1 << 9) as u64;

    with_table(|table| {
        let table = table();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads as u64 {
                let (table, barrier) = (&table, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    let mut keys = (0..entries).map(|i| t * entries + i).collect::<Vec<_>>();
                    keys.shuffle(&mut rand::thread_rng());

                    for &key in &keys {
                        table.add(key, key).unwrap();
                    }
                    for &key in &keys {
                        table.del(key).unwrap();
                    }
                    table.unregister_thread();
                });
            }
        });

        table.quiescent_state();
        assert_eq!(table.len(), 0);
        assert_eq!(table.stats().live(), 0);
    });
}

// Snapshots taken while entries are allocated and freed never count a free without its
// allocation.
#[test]
fn stats_during_add_del() {
    let rounds = scaled(1 << 16) as u64;

    with_sound_table(|table| {
        let table = table();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..rounds {
                    table.add(i, i).unwrap();
                    table.del(i).unwrap();
                }
                table.unregister_thread();
                done.store(true, Ordering::Release);
            });

            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let stats = table.stats();
                    assert!(stats.freed <= stats.allocated, "{stats:?}");
                    assert!(stats.live() <= rounds as usize);
                }
            });
        });

        table.quiescent_state();
        assert_eq!(table.stats().live(), 0);
    });
}
