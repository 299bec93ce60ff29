use std::hint;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicU32, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;

use super::{walk, Reclaim, Walk};
use crate::cfg::trace;
use crate::raw::{Chain, Detached, Entry, Heap};

/// Sequence-lock based reclamation.
///
/// Writers make a shared counter odd for the duration of every mutation. Readers walk
/// the chain without any protection and then check that the counter did not change,
/// retrying the whole lookup if it did. Unlinked entries are freed as soon as the writer
/// releases the lock, after a full fence.
///
/// This strategy is **unsound**. A reader that is paused between its two counter reads
/// may still be walking an entry that a writer has since freed. The fence only narrows
/// that window. It is kept as a point of comparison for the other strategies.
///
/// By default a reader that finds a writer active spins on the counter, yielding its
/// time slice after a short burst of spins, and never blocks. Blocking on the counter
/// can be enabled with [`park_after`](SeqLock::park_after).
pub struct SeqLock {
    // Even while no writer is active.
    sequence: CachePadded<AtomicU32>,
    // The number of readers blocked on the sequence counter.
    waiters: AtomicU32,
    park_after: Option<u32>,
}

impl SeqLock {
    // Spins before a reader starts yielding between reads of the counter.
    const SPINS: u32 = 128;

    /// Creates the sequence lock strategy.
    pub fn new() -> SeqLock {
        SeqLock {
            sequence: CachePadded::new(AtomicU32::new(0)),
            waiters: AtomicU32::new(0),
            park_after: None,
        }
    }

    /// Makes readers block on the counter after spinning on an active writer `spins`
    /// times, instead of spinning until the writer is done.
    ///
    /// Blocked readers are woken by the writer when it leaves its write section. Parking
    /// is disabled by default.
    pub fn park_after(mut self, spins: u32) -> SeqLock {
        self.park_after = Some(spins);
        self
    }

    // Wait until no writer is active and return the sequence.
    fn read_begin(&self) -> u32 {
        let mut spins = 0u32;

        loop {
            let sequence = self.sequence.load(Ordering::Acquire);
            if sequence & 1 == 0 {
                return sequence;
            }

            match self.park_after {
                Some(limit) if spins >= limit => self.wait(sequence),
                _ if spins < SeqLock::SPINS => hint::spin_loop(),
                _ => thread::yield_now(),
            }

            spins = spins.saturating_add(1);
        }
    }

    // Block until the sequence moves past `sequence`.
    #[cold]
    fn wait(&self, sequence: u32) {
        // seqcst: announce ourselves before the final check, see `write_end`
        self.waiters.fetch_add(1, Ordering::SeqCst);

        // the wait returns immediately if the writer has already moved on
        atomic_wait::wait(&self.sequence, sequence);

        self.waiters.fetch_sub(1, Ordering::Relaxed);
    }

    // Returns `true` if a writer was active since `read_begin` returned `sequence`.
    fn read_retry(&self, sequence: u32) -> bool {
        // acquire: order the loads of the walk before the second read of the counter
        atomic::fence(Ordering::Acquire);
        self.sequence.load(Ordering::Relaxed) != sequence
    }
}

impl Default for SeqLock {
    fn default() -> SeqLock {
        SeqLock::new()
    }
}

impl Reclaim for SeqLock {
    type Meta = ();

    const NAME: &'static str = "seqlock";

    fn meta(&self) {}

    fn lookup(&self, chain: Chain<'_, ()>, key: u64) -> Option<u64> {
        loop {
            let sequence = self.read_begin();

            // Unsound: entries may be freed while we walk them. The sequence check below
            // discards the result of any walk that overlapped a writer, but cannot undo
            // the reads themselves.
            let value = match unsafe { walk(chain.head, key) } {
                Walk::Found(entry) => Some(unsafe { entry.as_ref() }.value),
                Walk::NotFound => None,
                Walk::Retired => {
                    trace!("lookup of key {} reached an unlinked entry, restarting", key);
                    continue;
                }
            };

            // any conclusion drawn while a writer was active is discarded, including
            // "not found"
            if self.read_retry(sequence) {
                trace!("lookup of key {} overlapped a writer, restarting", key);
                continue;
            }

            return value;
        }
    }

    fn write_begin(&self) {
        // the lock is held, so no other writer can change the counter
        let sequence = self.sequence.load(Ordering::Relaxed);
        debug_assert!(sequence & 1 == 0, "nested write section");
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);

        // release: order the odd counter before the mutation
        atomic::fence(Ordering::Release);
    }

    fn write_end(&self) {
        // seqcst: either a blocked reader sees the even counter, or we see the reader
        self.sequence.fetch_add(1, Ordering::SeqCst);

        if self.waiters.load(Ordering::SeqCst) != 0 {
            atomic_wait::wake_all(&*self.sequence);
        }
    }

    unsafe fn retire(&self, entry: NonNull<Entry<()>>, heap: &Heap) {
        // make the unlink globally visible before the entry is freed
        atomic::fence(Ordering::SeqCst);
        unsafe { heap.free(entry) };
    }

    unsafe fn retire_all(&self, detached: Detached<()>, heap: &Heap) {
        atomic::fence(Ordering::SeqCst);

        for entry in detached {
            unsafe { heap.free(entry) };
        }
    }
}
