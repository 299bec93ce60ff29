use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};

use super::{check_live, Reclaim};
use crate::cfg::trace;
use crate::raw::{Chain, Entry, Heap, Next};

/// Reference-count based reclamation.
///
/// Every entry carries a reference count, starting at one for the table's own
/// reference. A reader acquires a reference to each entry before reading it and releases
/// the previous one afterwards; whoever releases the last reference frees the entry.
///
/// This strategy is **unsound**. A reader loads the address of the next entry and only
/// then increments its count, and nothing prevents the entry from being freed in
/// between: the increment itself may touch freed memory. It is kept as a point of
/// comparison for the other strategies.
#[derive(Clone, Copy, Debug, Default)]
pub struct RefCount;

impl RefCount {
    /// Creates the reference counting strategy.
    pub fn new() -> RefCount {
        RefCount
    }

    // Release a reference, freeing the entry if it was the last one.
    //
    // # Safety
    //
    // The caller must own a reference to the entry.
    unsafe fn release(entry: NonNull<Entry<Count>>, heap: &Heap) {
        if unsafe { entry.as_ref() }.meta.release() {
            trace!("released last reference to entry {:p}", entry);

            // Safety: this was the last reference, and the entry is no longer linked.
            unsafe { heap.free(entry) };
        }
    }
}

impl Reclaim for RefCount {
    type Meta = Count;

    const NAME: &'static str = "refcount";

    fn meta(&self) -> Count {
        Count::new()
    }

    fn lookup(&self, chain: Chain<'_, Count>, key: u64) -> Option<u64> {
        'retry: loop {
            let mut held: Option<NonNull<Entry<Count>>> = None;
            let mut link = chain.head;

            loop {
                let entry = match link.load(Ordering::Acquire) {
                    Next::Entry(entry) => entry,
                    Next::End => {
                        if let Some(held) = held {
                            unsafe { RefCount::release(held, chain.heap) };
                        }

                        return None;
                    }
                    // the entry we hold was unlinked
                    Next::Retired => {
                        if let Some(held) = held {
                            unsafe { RefCount::release(held, chain.heap) };
                        }

                        trace!("lookup of key {} raced with an unlink, restarting", key);
                        continue 'retry;
                    }
                };

                // Unsound: the entry may have been unlinked and freed since its address
                // was loaded above. Nothing we hold keeps it alive until the count below
                // is incremented.
                let next = unsafe { entry.as_ref() };
                check_live(next);

                if !next.meta.acquire() {
                    // the entry is being freed
                    if let Some(held) = held {
                        unsafe { RefCount::release(held, chain.heap) };
                    }

                    trace!("lookup of key {} reached a dead entry, restarting", key);
                    continue 'retry;
                }

                // only give up the previous entry once the next one is secured
                if let Some(held) = held {
                    unsafe { RefCount::release(held, chain.heap) };
                }
                held = Some(entry);

                if next.key == key {
                    let value = next.value;
                    unsafe { RefCount::release(entry, chain.heap) };
                    return Some(value);
                }

                link = &next.next;
            }
        }
    }

    // Drop the table's reference. Readers holding a reference keep the entry alive.
    unsafe fn retire(&self, entry: NonNull<Entry<Count>>, heap: &Heap) {
        unsafe { RefCount::release(entry, heap) }
    }
}

/// A reference count embedded in every entry.
///
/// A count of zero or less means the entry is being freed, and no new references may be
/// acquired.
pub struct Count(AtomicIsize);

impl Count {
    // A new count, holding the table's reference.
    fn new() -> Count {
        Count(AtomicIsize::new(1))
    }

    // Acquire a reference if the count is still positive.
    //
    // Returns `false` if the entry is being freed. Only spins while the count is
    // contended by other readers.
    fn acquire(&self) -> bool {
        let mut count = self.0.load(Ordering::Acquire);

        loop {
            if count <= 0 {
                return false;
            }

            match self.0.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(found) => count = found,
            }
        }
    }

    // Release a reference.
    //
    // Returns `true` if this was the last reference, in which case the caller must free
    // the entry.
    fn release(&self) -> bool {
        // acqrel: all reads through this reference happen before the entry is freed by
        // whoever drops the count to zero
        self.0.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[cfg(test)]
    fn get(&self) -> isize {
        self.0.load(Ordering::Relaxed)
    }
}
