use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::Error;

// A route in the chain.
pub struct Entry<M> {
    pub key: u64,
    pub value: u64,
    pub next: Link<M>,
    // Set exactly once, right before the entry is returned to the allocator.
    pub freed: AtomicBool,
    // Strategy-specific reclamation state.
    pub meta: M,
}

impl<M> Entry<M> {
    // Allocate an unlinked entry.
    //
    // Entries are allocated directly through the global allocator so that allocation
    // failure can be reported to the caller instead of aborting.
    pub(super) fn alloc(key: u64, value: u64, meta: M) -> Result<NonNull<Entry<M>>, Error> {
        let layout = Layout::new::<Entry<M>>();

        unsafe {
            let ptr = NonNull::new(alloc::alloc(layout).cast::<Entry<M>>()).ok_or(Error::OutOfMemory)?;

            ptr.as_ptr().write(Entry {
                key,
                value,
                next: Link::end(),
                freed: AtomicBool::new(false),
                meta,
            });

            Ok(ptr)
        }
    }

    // Deallocate an entry.
    //
    // # Safety
    //
    // The entry must have been allocated with `Entry::alloc`, and must not be accessed
    // again by any thread.
    pub(super) unsafe fn dealloc(entry: NonNull<Entry<M>>) {
        unsafe {
            entry.as_ref().freed.store(true, Ordering::Release);
            ptr::drop_in_place(entry.as_ptr());
            alloc::dealloc(entry.as_ptr().cast::<u8>(), Layout::new::<Entry<M>>());
        }
    }
}

// The address of the retired sentinel.
//
// Entries are at least word aligned, so this address is never a valid entry.
const RETIRED: usize = 0b1;

// The decoded value of a link.
pub enum Next<M> {
    // The link points to a live entry.
    Entry(NonNull<Entry<M>>),
    // The end of the chain.
    End,
    // The entry owning this link was unlinked. Readers must restart from the head.
    Retired,
}

impl<M> Next<M> {
    #[inline]
    fn from_raw(ptr: *mut Entry<M>) -> Next<M> {
        if ptr.is_null() {
            Next::End
        } else if ptr as usize == RETIRED {
            Next::Retired
        } else {
            // Safety: checked for null above.
            Next::Entry(unsafe { NonNull::new_unchecked(ptr) })
        }
    }

    // Returns the raw encoded value of this link.
    #[inline]
    pub fn as_raw(self) -> *mut Entry<M> {
        match self {
            Next::Entry(entry) => entry.as_ptr(),
            Next::End => ptr::null_mut(),
            Next::Retired => ptr::null_mut::<u8>().wrapping_add(RETIRED).cast(),
        }
    }
}

impl<M> Copy for Next<M> {}

impl<M> Clone for Next<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> PartialEq for Next<M> {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl<M> Eq for Next<M> {}

impl<M> fmt::Debug for Next<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Entry(entry) => f.debug_tuple("Entry").field(entry).finish(),
            Next::End => f.write_str("End"),
            Next::Retired => f.write_str("Retired"),
        }
    }
}

// An atomic reference to the next entry in the chain.
//
// Any thread may load a link, but links are only written by the thread holding the
// table's write lock, or by the owner of an entry that is not reachable from the head.
#[repr(transparent)]
pub struct Link<M>(AtomicPtr<Entry<M>>);

impl<M> Link<M> {
    pub const fn end() -> Link<M> {
        Link(AtomicPtr::new(ptr::null_mut()))
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> Next<M> {
        Next::from_raw(self.0.load(ordering))
    }

    #[inline]
    pub(super) fn store(&self, next: Next<M>, ordering: Ordering) {
        self.0.store(next.as_raw(), ordering)
    }

    #[inline]
    pub(super) fn swap(&self, next: Next<M>, ordering: Ordering) -> Next<M> {
        Next::from_raw(self.0.swap(next.as_raw(), ordering))
    }
}

// The chain detached from the head by `clear`.
//
// Iterating poisons the link of each yielded entry, after reading its successor, so
// yielded entries can be retired immediately.
pub struct Detached<M> {
    next: Next<M>,
}

impl<M> Detached<M> {
    pub(super) fn new(first: Next<M>) -> Detached<M> {
        Detached { next: first }
    }
}

impl<M> Iterator for Detached<M> {
    type Item = NonNull<Entry<M>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next {
            Next::Entry(entry) => {
                // Safety: detached entries are owned by the clearing thread until retired.
                let next = unsafe { entry.as_ref().next.swap(Next::Retired, Ordering::SeqCst) };
                self.next = next;
                Some(entry)
            }
            Next::End | Next::Retired => None,
        }
    }
}
