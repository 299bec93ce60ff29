#![allow(dead_code)]

use route_table::reclaim::{Hazard, Locked, RefCount, SeqLock};
use route_table::{Reclaim, RouteTable, Table};

// Run the test against a table of every strategy.
pub fn with_table(mut test: impl FnMut(&dyn Fn() -> Box<dyn RouteTable>)) {
    with_sound_table(&mut test);

    test(&(|| table(RefCount::new())));

    // Park readers immediately to exercise the blocking path.
    test(&(|| table(SeqLock::new().park_after(0))));
    if !cfg!(route_table_stress) {
        test(&(|| table(SeqLock::new())));
    }
}

// Run the test against a table of every strategy that never lets a reader observe freed
// memory, and can therefore race removals against lookups.
pub fn with_sound_table(mut test: impl FnMut(&dyn Fn() -> Box<dyn RouteTable>)) {
    if !cfg!(route_table_stress) {
        test(&(|| table(Hazard::new())));
    }

    // Reclaim after every removal to maximize interference with readers.
    test(&(|| table(Hazard::new().batch_size(1))));

    // More slots than a lookup needs, and a registry that has to grow.
    test(&(|| table(Hazard::new().slots(4).threads(1))));

    test(&(|| table(Locked::new())));
}

fn table<R: Reclaim + 'static>(strategy: R) -> Box<dyn RouteTable> {
    Box::new(Table::with_strategy(strategy))
}

// Prints a log message if `RUST_LOG=debug` is set.
#[macro_export]
macro_rules! debug {
    ($($x:tt)*) => {
        if std::env::var("RUST_LOG").as_deref() == Ok("debug") {
            println!($($x)*);
        }
    };
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two()
    }
}

// Scales an iteration count to the test configuration.
pub fn scaled(n: usize) -> usize {
    if cfg!(miri) {
        (n / 64).max(1)
    } else if cfg!(route_table_stress) {
        n * 16
    } else {
        n
    }
}
