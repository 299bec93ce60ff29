use std::ptr::NonNull;

use super::{walk, Reclaim, Walk};
use crate::raw::{Chain, Detached, Entry, Heap};

/// Mutual exclusion, with no concurrent reclamation at all.
///
/// Lookups take the same lock as writers, so no reader ever overlaps a mutation and
/// unlinked entries are freed immediately, before the lock is released. This is the
/// reference point for the other strategies.
#[derive(Clone, Copy, Debug, Default)]
pub struct Locked;

impl Locked {
    /// Creates the mutual exclusion strategy.
    pub fn new() -> Locked {
        Locked
    }
}

impl Reclaim for Locked {
    type Meta = ();

    const NAME: &'static str = "locked";

    const RETIRE_LOCKED: bool = true;

    fn meta(&self) {}

    fn lookup(&self, chain: Chain<'_, ()>, key: u64) -> Option<u64> {
        let _guard = chain.lock();

        // Safety: the chain cannot be mutated while we hold the lock.
        match unsafe { walk(chain.head, key) } {
            Walk::Found(entry) => Some(unsafe { entry.as_ref() }.value),
            Walk::NotFound => None,
            Walk::Retired => {
                debug_assert!(false, "encountered a retired entry under the lock");
                None
            }
        }
    }

    unsafe fn retire(&self, entry: NonNull<Entry<()>>, heap: &Heap) {
        // Safety: retirement runs under the lock, no reader can reach the entry.
        unsafe { heap.free(entry) };
    }

    unsafe fn retire_all(&self, detached: Detached<()>, heap: &Heap) {
        for entry in detached {
            unsafe { heap.free(entry) };
        }
    }
}
