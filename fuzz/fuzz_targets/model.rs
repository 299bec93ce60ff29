#![no_main]

use libfuzzer_sys::fuzz_target;

use arbitrary::Arbitrary;
use route_table::reclaim::{Hazard, Locked, RefCount, SeqLock};
use route_table::{Error, RouteTable, Table};
use std::collections::HashMap;

#[derive(Debug, Arbitrary)]
enum Operation {
    Add(u32, u32),
    Del(u32),
    Lookup(u32),
    Clear,
    Len,
    Quiescent,
}

#[derive(Debug, Arbitrary)]
enum Strategy {
    Hazard { batch_size: u8 },
    RefCount,
    SeqLock,
    Locked,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    strategy: Strategy,
    operations: Vec<Operation>,
}

fn table(strategy: Strategy) -> Box<dyn RouteTable> {
    match strategy {
        Strategy::Hazard { batch_size } => Box::new(Table::with_strategy(
            Hazard::new().batch_size(batch_size.into()),
        )),
        Strategy::RefCount => Box::new(Table::with_strategy(RefCount::new())),
        Strategy::SeqLock => Box::new(Table::with_strategy(SeqLock::new())),
        Strategy::Locked => Box::new(Table::with_strategy(Locked::new())),
    }
}

fn fuzz_table(input: FuzzInput) {
    // every key maps to a stack of values, the most recently added first
    let mut model: HashMap<u32, Vec<u32>> = HashMap::new();
    let table = table(input.strategy);

    for op in input.operations {
        match op {
            Operation::Add(k, v) => {
                model.entry(k).or_default().push(v);
                table.add(k.into(), v.into()).unwrap();
            }
            Operation::Del(k) => {
                let expected = match model.get_mut(&k).and_then(Vec::pop) {
                    Some(_) => Ok(()),
                    None => Err(Error::NotFound),
                };
                assert_eq!(table.del(k.into()), expected);
            }
            Operation::Lookup(k) => {
                let expected = model.get(&k).and_then(|values| values.last());
                assert_eq!(table.lookup(k.into()), expected.map(|&v| v.into()));
            }
            Operation::Clear => {
                model.clear();
                table.clear();
            }
            Operation::Len => {
                assert_eq!(table.len(), model.values().map(Vec::len).sum::<usize>());
            }
            Operation::Quiescent => table.quiescent_state(),
        }
    }

    table.quiescent_state();
    assert!(table.stats().live() >= table.len());
}

fuzz_target!(|input: FuzzInput| {
    fuzz_table(input);
});
