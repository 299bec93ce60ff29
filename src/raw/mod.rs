mod entry;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

pub use self::entry::{Detached, Entry, Link, Next};
use crate::cfg::trace;
use crate::reclaim::Reclaim;
use crate::{Error, Stats};

// A singly linked routing table.
//
// All structural mutation goes through a `Writer`, which holds the write lock for its
// lifetime. Readers only ever see the chain through a `Chain`, which hands out shared
// links that cannot be written to.
pub struct Table<R: Reclaim> {
    head: Link<R::Meta>,
    lock: Mutex<()>,
    heap: Heap,
    reclaim: R,
}

impl<R: Reclaim> Table<R> {
    pub fn new(reclaim: R) -> Table<R> {
        reclaim.init();

        Table {
            head: Link::end(),
            lock: Mutex::new(()),
            heap: Heap::default(),
            reclaim,
        }
    }

    pub fn reclaim(&self) -> &R {
        &self.reclaim
    }

    pub fn stats(&self) -> Stats {
        self.heap.stats()
    }

    // Returns the read-side view of the chain.
    #[inline]
    pub fn chain(&self) -> Chain<'_, R::Meta> {
        Chain {
            head: &self.head,
            lock: &self.lock,
            heap: &self.heap,
        }
    }

    // Acquire the write lock and enter a write section.
    fn write(&self) -> Writer<'_, R> {
        let guard = self.lock.lock();
        self.reclaim.write_begin();

        Writer {
            table: self,
            _guard: guard,
        }
    }

    pub fn lookup(&self, key: u64) -> Option<u64> {
        self.reclaim.lookup(self.chain(), key)
    }

    pub fn add(&self, key: u64, value: u64) -> Result<(), Error> {
        // Allocate before taking the lock, a failed allocation leaves the table untouched.
        let entry = self.heap.alloc(key, value, self.reclaim.meta())?;

        let mut writer = self.write();
        writer.push(entry);

        Ok(())
    }

    pub fn del(&self, key: u64) -> Result<(), Error> {
        let mut writer = self.write();
        let entry = writer.unlink(key).ok_or(Error::NotFound)?;

        if R::RETIRE_LOCKED {
            // Safety: the entry was unlinked above.
            unsafe { self.reclaim.retire(entry, &self.heap) };
            return Ok(());
        }

        drop(writer);

        // Safety: the entry was unlinked above.
        unsafe { self.reclaim.retire(entry, &self.heap) };
        Ok(())
    }

    pub fn clear(&self) {
        let mut writer = self.write();
        let detached = writer.detach();

        if R::RETIRE_LOCKED {
            // Safety: the chain was detached from the head.
            unsafe { self.reclaim.retire_all(detached, &self.heap) };
            return;
        }

        drop(writer);

        // Safety: the chain was detached from the head.
        unsafe { self.reclaim.retire_all(detached, &self.heap) };
    }

    pub fn len(&self) -> usize {
        // Counting does not mutate the chain, so no write section is entered.
        let _guard = self.lock.lock();

        let mut len = 0;
        let mut next = self.head.load(Ordering::Relaxed);

        while let Next::Entry(entry) = next {
            len += 1;
            // Safety: the chain cannot be mutated while we hold the lock.
            next = unsafe { entry.as_ref().next.load(Ordering::Relaxed) };
        }

        len
    }

    pub fn register_thread(&self) {
        self.reclaim.register_thread();
    }

    pub fn unregister_thread(&self) {
        self.reclaim.unregister_thread(&self.heap);
    }

    pub fn quiescent_state(&self) {
        self.reclaim.quiescent_state(&self.heap);
    }
}

impl<R: Reclaim> Table<R> {
    // Free every linked entry, and every entry still pending reclamation.
    fn free_all(&mut self) {
        let mut next = self.head.swap(Next::End, Ordering::Relaxed);

        while let Next::Entry(entry) = next {
            // Safety: we have `&mut self`, no readers can access the chain.
            unsafe {
                next = entry.as_ref().next.load(Ordering::Relaxed);
                self.heap.free(entry);
            }
        }

        self.reclaim.drain(&self.heap);
    }
}

impl<R: Reclaim> Drop for Table<R> {
    fn drop(&mut self) {
        self.free_all();
    }
}

// Exclusive access to the chain.
//
// The strategy's write section is exited before the lock is released.
struct Writer<'t, R: Reclaim> {
    table: &'t Table<R>,
    _guard: MutexGuard<'t, ()>,
}

impl<R: Reclaim> Writer<'_, R> {
    // Link an entry at the head of the chain.
    fn push(&mut self, entry: NonNull<Entry<R::Meta>>) {
        let head = &self.table.head;

        // Safety: the entry is not yet reachable by any other thread.
        unsafe { entry.as_ref().next.store(head.load(Ordering::Relaxed), Ordering::Relaxed) };

        // Publish the initialized entry.
        head.store(Next::Entry(entry), Ordering::SeqCst);
        trace!("linked entry {:p}", entry);
    }

    // Unlink the first entry with the given key, poisoning its link.
    fn unlink(&mut self, key: u64) -> Option<NonNull<Entry<R::Meta>>> {
        let mut link = &self.table.head;

        loop {
            // Relaxed: only the writer stores to links.
            let entry = match link.load(Ordering::Relaxed) {
                Next::Entry(entry) => entry,
                Next::End => return None,
                Next::Retired => {
                    debug_assert!(false, "encountered a retired entry in the chain");
                    return None;
                }
            };

            // Safety: entries reachable from the head are only freed after being unlinked,
            // which requires the lock we hold.
            let current = unsafe { entry.as_ref() };

            if current.key == key {
                link.store(current.next.load(Ordering::Relaxed), Ordering::SeqCst);
                current.next.store(Next::Retired, Ordering::SeqCst);

                trace!("unlinked entry {:p} for key {}", entry, key);
                return Some(entry);
            }

            link = &current.next;
        }
    }

    // Detach the entire chain from the head.
    fn detach(&mut self) -> Detached<R::Meta> {
        Detached::new(self.table.head.swap(Next::End, Ordering::SeqCst))
    }
}

impl<R: Reclaim> Drop for Writer<'_, R> {
    fn drop(&mut self) {
        self.table.reclaim.write_end();
    }
}

// The read-side view of the chain handed to a reclamation strategy.
pub struct Chain<'t, M> {
    pub head: &'t Link<M>,
    pub heap: &'t Heap,
    lock: &'t Mutex<()>,
}

impl<'t, M> Chain<'t, M> {
    // Acquire the write lock, excluding all mutation.
    pub fn lock(&self) -> MutexGuard<'t, ()> {
        self.lock.lock()
    }
}

// Allocates and frees entries, keeping track of both.
#[derive(Default)]
pub struct Heap {
    allocated: AtomicUsize,
    freed: AtomicUsize,
}

impl Heap {
    fn alloc<M>(&self, key: u64, value: u64, meta: M) -> Result<NonNull<Entry<M>>, Error> {
        let entry = Entry::alloc(key, value, meta)?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    // Return an entry to the allocator.
    //
    // # Safety
    //
    // The entry must have been unlinked, and no thread may access it after this call.
    pub unsafe fn free<M>(&self, entry: NonNull<Entry<M>>) {
        unsafe { Entry::dealloc(entry) };

        // release: the allocation of the entry happens before its free is counted
        self.freed.fetch_add(1, Ordering::Release);
    }

    // `freed` is loaded first. Every free it observes was preceded by the matching
    // allocation, so the snapshot never counts more frees than allocations.
    fn stats(&self) -> Stats {
        let freed = self.freed.load(Ordering::Acquire);
        let allocated = self.allocated.load(Ordering::Relaxed);

        Stats { allocated, freed }
    }
}
