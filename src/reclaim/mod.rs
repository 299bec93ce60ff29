//! Memory reclamation strategies.
//!
//! A strategy decides how [`lookup`](crate::Table::lookup) can safely read entries that a
//! concurrent writer may be unlinking, and when an unlinked entry is returned to the
//! allocator. Writers always serialize through the table's lock; strategies only differ
//! in what readers do.
//!
//! | Strategy     | Readers                       | Unlinked entries are freed                  |
//! |--------------|-------------------------------|---------------------------------------------|
//! | [`Hazard`]   | publish hazard pointers       | by a later pass once no hazard names them   |
//! | [`RefCount`] | acquire a reference per entry | when the last reference is released         |
//! | [`SeqLock`]  | validate a sequence counter   | immediately, after a full fence             |
//! | [`Locked`]   | take the write lock           | immediately, under the lock                 |
//!
//! [`RefCount`] and [`SeqLock`] are intentionally unsound: both leave a window in which
//! a reader may touch an entry that was just freed. They exist as points of comparison
//! and must not be used where that matters.

mod hazard;
mod locked;
mod refcount;
mod seqlock;

pub use hazard::Hazard;
pub use locked::Locked;
pub use refcount::RefCount;
pub use seqlock::SeqLock;

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::cfg::error;
use crate::raw::{Chain, Detached, Entry, Heap, Link, Next};

/// A memory reclamation strategy for a [`Table`](crate::Table).
///
/// This trait is implemented by [`Hazard`], [`RefCount`], [`SeqLock`] and [`Locked`],
/// and cannot be implemented outside of this crate.
pub trait Reclaim: Send + Sync + Sized + sealed::Sealed {
    /// A short name for the strategy.
    const NAME: &'static str;

    #[doc(hidden)]
    type Meta: Send + Sync;

    /// Whether unlinked entries are retired before the write lock is released.
    #[doc(hidden)]
    const RETIRE_LOCKED: bool = false;

    /// Returns the reclamation state of a newly allocated entry.
    #[doc(hidden)]
    fn meta(&self) -> Self::Meta;

    /// Called once when a table is created with this strategy.
    #[doc(hidden)]
    fn init(&self) {}

    #[doc(hidden)]
    fn register_thread(&self) {}

    #[doc(hidden)]
    fn unregister_thread(&self, _heap: &Heap) {}

    #[doc(hidden)]
    fn quiescent_state(&self, _heap: &Heap) {}

    /// Find the value for `key` without the write lock.
    #[doc(hidden)]
    fn lookup(&self, chain: Chain<'_, Self::Meta>, key: u64) -> Option<u64>;

    /// Called after the write lock is acquired, before any mutation.
    #[doc(hidden)]
    fn write_begin(&self) {}

    /// Called after all mutation, before the write lock is released.
    #[doc(hidden)]
    fn write_end(&self) {}

    /// Retire an entry that was unlinked from the chain.
    ///
    /// # Safety
    ///
    /// The entry must have been unlinked and poisoned, and must not be retired twice.
    #[doc(hidden)]
    unsafe fn retire(&self, entry: NonNull<Entry<Self::Meta>>, heap: &Heap);

    /// Retire every entry of a chain detached by `clear`.
    ///
    /// # Safety
    ///
    /// The chain must have been detached from the head.
    #[doc(hidden)]
    unsafe fn retire_all(&self, detached: Detached<Self::Meta>, heap: &Heap) {
        for entry in detached {
            unsafe { self.retire(entry, heap) }
        }
    }

    /// Free any entries still pending reclamation. Called when the table is dropped.
    #[doc(hidden)]
    fn drain(&mut self, _heap: &Heap) {}
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Hazard {}
    impl Sealed for super::RefCount {}
    impl Sealed for super::SeqLock {}
    impl Sealed for super::Locked {}
}

// The outcome of an unsynchronized walk of the chain.
enum Walk<M> {
    Found(NonNull<Entry<M>>),
    NotFound,
    // An unlinked entry was reached, the walk must restart from the head.
    Retired,
}

// Walk the chain with plain loads, without protecting any entry.
//
// # Safety
//
// Either the write lock must be held, or the caller must accept that entries may be
// freed while they are being read.
unsafe fn walk<M>(head: &Link<M>, key: u64) -> Walk<M> {
    let mut link = head;

    loop {
        match link.load(Ordering::Acquire) {
            Next::Entry(entry) => {
                let current = unsafe { entry.as_ref() };
                check_live(current);

                if current.key == key {
                    return Walk::Found(entry);
                }

                link = &current.next;
            }
            Next::End => return Walk::NotFound,
            Next::Retired => return Walk::Retired,
        }
    }
}

// Check that an entry a reader is about to use has not been returned to the allocator.
//
// Reaching a freed entry means the active strategy let a reader outlive the entry, which
// is a defect in the strategy, not something a caller can recover from.
#[inline]
fn check_live<M>(entry: &Entry<M>) {
    if entry.freed.load(Ordering::Acquire) {
        violation(entry.key);
    }
}

#[cold]
#[inline(never)]
fn violation(key: u64) -> ! {
    error!("reader dereferenced a freed entry while looking up key {}", key);
    eprintln!("route-table: reclamation invariant violated, freed entry read while looking up key {key}");
    std::process::abort()
}
