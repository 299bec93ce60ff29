use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use route_table::reclaim::{Hazard, Locked, RefCount, SeqLock};
use route_table::{RouteTable, Table};

const SIZES: [u64; 3] = [16, 256, 4096];

#[derive(Clone, Copy)]
struct RandomKeys {
    state: u64,
    range: u64,
}

impl RandomKeys {
    fn new(range: u64) -> Self {
        RandomKeys { state: 0, range }
    }
}

impl Iterator for RandomKeys {
    type Item = u64;
    fn next(&mut self) -> Option<u64> {
        // Add 1 then multiply by some 32 bit prime.
        self.state = self.state.wrapping_add(1).wrapping_mul(3_787_392_781);
        Some(self.state % self.range)
    }
}

fn tables() -> Vec<Box<dyn RouteTable>> {
    vec![
        Box::new(Table::with_strategy(Hazard::new())),
        Box::new(Table::with_strategy(RefCount::new())),
        Box::new(Table::with_strategy(SeqLock::new())),
        Box::new(Table::with_strategy(Locked::new())),
    ]
}

fn lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in SIZES {
        for table in tables() {
            for key in 0..size {
                table.add(key, !key).unwrap();
            }

            group.bench_with_input(
                BenchmarkId::new(table.strategy_name(), size),
                &size,
                |b, &size| {
                    b.iter(|| {
                        for key in RandomKeys::new(size).take(64) {
                            black_box(assert_eq!(table.lookup(key), Some(!key)));
                        }
                    });
                },
            );
        }
    }

    group.finish();
}

fn miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("miss");

    for table in tables() {
        for key in 0..256 {
            table.add(key, key).unwrap();
        }

        group.bench_function(table.strategy_name(), |b| {
            b.iter(|| black_box(assert_eq!(table.lookup(black_box(1 << 20)), None)));
        });
    }

    group.finish();
}

criterion_group!(benches, lookup, miss);
criterion_main!(benches);
