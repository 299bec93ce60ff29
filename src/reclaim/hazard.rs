use std::cell::{Cell, UnsafeCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use thread_local::ThreadLocal;

use super::{check_live, Reclaim};
use crate::cfg::trace;
use crate::raw::{Chain, Entry, Heap, Link, Next};

type HazardEntry = Entry<Header>;

/// Hazard-pointer based reclamation.
///
/// Every thread owns a small array of hazard slots. A reader publishes the address of
/// each entry it is about to read into one of its slots, and confirms that the entry is
/// still linked before reading it. Unlinked entries are queued on the retiring thread
/// and freed by a later reclamation pass, once no thread's slots name them.
///
/// Lookups never block and never touch freed memory.
pub struct Hazard {
    // Per-thread hazard slots and pending entries.
    threads: ThreadLocal<CachePadded<Local>>,
    // Pending entries of threads that unregistered while the entries were still
    // protected by another thread.
    orphans: Mutex<RetiredList>,
    slots: usize,
    batch_size: usize,
}

impl Hazard {
    const DEFAULT_SLOTS: usize = 2;
    const DEFAULT_BATCH_SIZE: usize = 64;

    /// Creates a new hazard pointer domain.
    pub fn new() -> Hazard {
        Hazard {
            threads: ThreadLocal::with_capacity(num_cpus::get()),
            orphans: Mutex::new(RetiredList::new()),
            slots: Hazard::DEFAULT_SLOTS,
            batch_size: Hazard::DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the number of hazard slots owned by each thread.
    ///
    /// A lookup rotates through the slots, publishing each entry it visits into the next
    /// one, so the last `slots` entries it visited stay protected. Two slots are needed
    /// to protect the entry being read and the entry being moved to, values below two
    /// are rounded up. Every reclamation pass scans all slots of all threads.
    ///
    /// The default is `2`.
    pub fn slots(mut self, slots: usize) -> Hazard {
        self.slots = slots.max(Hazard::DEFAULT_SLOTS);
        self
    }

    /// Sets the number of entries a thread retires before attempting to free them.
    ///
    /// Every reclamation pass scans the hazard slots of all threads, so larger batches
    /// amortize the scan at the cost of holding more unlinked entries in memory.
    ///
    /// The default is `64`.
    pub fn batch_size(mut self, batch_size: usize) -> Hazard {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the number of threads the slot registry is initially sized for.
    ///
    /// The registry grows as needed. The default is the number of CPUs.
    pub fn threads(mut self, threads: usize) -> Hazard {
        self.threads = ThreadLocal::with_capacity(threads);
        self
    }

    // Returns the current thread's state, binding a slot array on first use.
    fn local(&self) -> &Local {
        let mut created = false;
        let local = self.threads.get_or(|| {
            created = true;
            CachePadded::new(Local::new(self.slots))
        });

        if created {
            // seqcst: synchronize with the fence in a reclamation pass
            // - if this fence comes first, the reclaiming thread will see our state
            //   and any hazards published through it
            // - if their fence comes first, we will see every unlink that preceded
            //   the pass, and never confirm a hazard to an entry it frees
            atomic::fence(Ordering::SeqCst);
        }

        local
    }

    // Load the link and protect the entry it points to.
    //
    // The link is re-read after the hazard is published: if it still holds the same
    // value, the entry was linked at a point after our hazard became visible, and no
    // reclamation pass that could free it will miss the hazard.
    fn protect(link: &Link<Header>, slot: &AtomicPtr<HazardEntry>) -> Next<Header> {
        let mut next = link.load(Ordering::Acquire);

        loop {
            // seqcst: publish the hazard before confirming, see the fence in `reclaim`
            slot.store(next.as_raw(), Ordering::SeqCst);

            let confirmed = link.load(Ordering::SeqCst);
            if confirmed == next {
                return next;
            }

            // raced with a writer between the read and the publish
            next = confirmed;
        }
    }

    // Free every pending entry of the current thread that is not protected by a hazard.
    fn reclaim(&self, local: &Local, heap: &Heap) {
        // Safety: the pending list is only accessed by its owning thread.
        let pending = unsafe { &mut *local.retired.get() };

        if let Some(mut orphans) = self.orphans.try_lock() {
            pending.append(&mut orphans);
        }

        if pending.is_empty() {
            return;
        }

        // seqcst: every entry in the pending list was unlinked before this fence. any
        // reader that confirmed a hazard to one of them published it before this fence,
        // otherwise its confirming load would have seen the unlink.
        atomic::fence(Ordering::SeqCst);

        let mut hazards = self
            .threads
            .iter()
            .flat_map(|local| local.slots.iter())
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|hazard| !hazard.is_null())
            .collect::<Vec<_>>();
        hazards.sort_unstable();

        let mut kept = RetiredList::new();
        let mut freed = 0;

        while let Some(entry) = pending.pop() {
            if hazards.binary_search(&entry.as_ptr()).is_ok() {
                kept.push(entry);
                continue;
            }

            // Safety: the entry is unlinked and no hazard names it. new hazards cannot
            // be confirmed for an unlinked entry.
            unsafe { heap.free(entry) };
            freed += 1;
        }

        trace!(
            "reclamation pass freed {} entries, {} still protected",
            freed,
            kept.len
        );

        *pending = kept;
    }
}

impl Default for Hazard {
    fn default() -> Hazard {
        Hazard::new()
    }
}

impl Reclaim for Hazard {
    type Meta = Header;

    const NAME: &'static str = "hazard";

    fn meta(&self) -> Header {
        Header::default()
    }

    fn register_thread(&self) {
        trace!("registering thread");
        self.local();
    }

    fn unregister_thread(&self, heap: &Heap) {
        let Some(local) = self.threads.get() else {
            return;
        };

        trace!("unregistering thread");
        local.clear();
        self.reclaim(local, heap);

        // Hand anything still protected to the next thread that reclaims.
        //
        // Safety: the pending list is only accessed by its owning thread.
        let pending = unsafe { &mut *local.retired.get() };
        if !pending.is_empty() {
            trace!("orphaning {} protected entries", pending.len);
            self.orphans.lock().append(pending);
        }
    }

    // A quiescent thread holds no hazards, which makes it a good time to free entries.
    fn quiescent_state(&self, heap: &Heap) {
        let local = self.local();
        local.clear();
        self.reclaim(local, heap);
    }

    fn lookup(&self, chain: Chain<'_, Header>, key: u64) -> Option<u64> {
        let local = self.local();

        let value = 'retry: loop {
            let mut link = chain.head;
            let mut slot = 0;

            loop {
                let entry = match Hazard::protect(link, &local.slots[slot]) {
                    Next::Entry(entry) => entry,
                    Next::End => break 'retry None,
                    // the entry we were reading from was unlinked
                    Next::Retired => {
                        trace!("lookup of key {} raced with an unlink, restarting", key);
                        continue 'retry;
                    }
                };

                // Safety: the entry is protected by our hazard.
                let current = unsafe { entry.as_ref() };
                check_live(current);

                if current.key == key {
                    break 'retry Some(current.value);
                }

                // keep protecting the current entry while moving to the next
                link = &current.next;
                slot = (slot + 1) % local.slots.len();
            }
        };

        local.clear();
        value
    }

    unsafe fn retire(&self, entry: NonNull<HazardEntry>, heap: &Heap) {
        let local = self.local();

        // Safety: the pending list is only accessed by its owning thread.
        let pending = unsafe { &mut *local.retired.get() };
        pending.push(entry);

        if pending.len >= self.batch_size {
            self.reclaim(local, heap);
        }
    }

    fn drain(&mut self, heap: &Heap) {
        let orphans = self.orphans.get_mut();

        for local in self.threads.iter_mut() {
            orphans.append(local.retired.get_mut());
        }

        while let Some(entry) = orphans.pop() {
            // Safety: `&mut self` guarantees no readers remain.
            unsafe { heap.free(entry) };
        }
    }
}

// Reclamation state embedded in every entry: the link used to queue it once retired.
pub struct Header {
    next: Cell<*mut HazardEntry>,
}

impl Default for Header {
    fn default() -> Header {
        Header {
            next: Cell::new(ptr::null_mut()),
        }
    }
}

// Safety: the link is only accessed by the thread that owns the pending list the entry
// is queued on.
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

// An intrusive list of retired entries.
struct RetiredList {
    head: *mut HazardEntry,
    len: usize,
}

impl RetiredList {
    fn new() -> RetiredList {
        RetiredList {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn push(&mut self, entry: NonNull<HazardEntry>) {
        // Safety: retired entries are owned by the list until freed.
        unsafe { entry.as_ref().meta.next.set(self.head) };
        self.head = entry.as_ptr();
        self.len += 1;
    }

    fn pop(&mut self) -> Option<NonNull<HazardEntry>> {
        let entry = NonNull::new(self.head)?;

        // Safety: retired entries are owned by the list until freed.
        self.head = unsafe { entry.as_ref().meta.next.replace(ptr::null_mut()) };
        self.len -= 1;

        Some(entry)
    }

    // Move all entries of `other` into this list.
    fn append(&mut self, other: &mut RetiredList) {
        while let Some(entry) = other.pop() {
            self.push(entry);
        }
    }
}

// Safety: the entries in the list are owned by it, and are not accessed through the
// list by more than one thread at a time.
unsafe impl Send for RetiredList {}

// The state a thread owns in a hazard domain.
struct Local {
    // The published hazards of this thread.
    slots: Box<[AtomicPtr<HazardEntry>]>,
    // Entries retired by this thread that are waiting to be freed.
    retired: UnsafeCell<RetiredList>,
}

impl Local {
    fn new(slots: usize) -> Local {
        Local {
            slots: (0..slots).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            retired: UnsafeCell::new(RetiredList::new()),
        }
    }

    // Release all hazards held by this thread.
    fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

// Safety: see `RetiredList`.
unsafe impl Send for Local {}

// Safety: other threads only read the hazard slots. The pending list is only accessed by
// the owning thread, or through `&mut Hazard`.
unsafe impl Sync for Local {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Table;

    #[test]
    fn protected_entries_survive_reclamation() {
        let table = Table::with_strategy(Hazard::new().batch_size(1));
        table.add(1, 10).unwrap();

        // publish a hazard to the entry, as a reader paused mid-lookup would
        let hazard = table.strategy();
        let local = hazard.local();
        let head = table.raw.chain().head;
        let entry = Hazard::protect(head, &local.slots[0]);
        assert!(matches!(entry, Next::Entry(_)));

        // the entry stays pending while protected, even past the batch size
        table.del(1).unwrap();
        assert_eq!(table.stats().freed, 0);

        local.clear();
        table.quiescent_state();
        assert_eq!(table.stats().freed, 1);
    }

    #[test]
    fn every_slot_is_scanned() {
        let table = Table::with_strategy(Hazard::new().slots(4).batch_size(1));
        table.add(1, 10).unwrap();
        table.add(2, 20).unwrap();

        assert_eq!(table.lookup(1), Some(10));
        let local = table.strategy().local();
        assert_eq!(local.slots.len(), 4);

        // a hazard in the last slot is respected by the reclamation pass
        let entry = Hazard::protect(table.raw.chain().head, &local.slots[3]);
        assert!(matches!(entry, Next::Entry(_)));

        table.del(2).unwrap();
        assert_eq!(table.stats().freed, 0);

        local.clear();
        table.quiescent_state();
        assert_eq!(table.stats().freed, 1);
    }

    #[test]
    fn lookups_release_every_slot() {
        let table = Table::with_strategy(Hazard::new().slots(3));
        for i in 0..8 {
            table.add(i, i).unwrap();
        }

        // the walk to the tail wraps around the slots more than once
        assert_eq!(table.lookup(0), Some(0));
        assert_eq!(table.lookup(100), None);

        let local = table.strategy().local();
        assert!(local
            .slots
            .iter()
            .all(|slot| slot.load(Ordering::Relaxed).is_null()));
    }

    #[test]
    fn orphans_are_adopted() {
        let table = Table::with_strategy(Hazard::new());
        table.add(1, 10).unwrap();

        // hold a hazard on this thread while another thread retires the entry and exits
        let local = table.strategy().local();
        let entry = Hazard::protect(table.raw.chain().head, &local.slots[0]);
        assert!(matches!(entry, Next::Entry(_)));

        std::thread::scope(|s| {
            s.spawn(|| {
                table.register_thread();
                table.del(1).unwrap();
                table.unregister_thread();
            });
        });

        assert_eq!(table.stats().freed, 0);

        local.clear();
        table.quiescent_state();
        assert_eq!(table.stats().freed, 1);
    }
}
