use crate::raw;
use crate::reclaim::{Hazard, Reclaim};
use crate::Error;

use std::fmt;
use std::marker::PhantomData;

/// The value [`Table::lookup_raw`] returns for a key that is not present.
pub const NOT_FOUND: u64 = u64::MAX;

/// A concurrent routing table, mapping addresses to interfaces.
///
/// Mutation ([`add`](Table::add), [`del`](Table::del) and [`clear`](Table::clear)) is
/// serialized through an internal lock. Lookups run concurrently with each other and with
/// the active writer, following the protocol of the table's reclamation strategy `R`.
/// See the [`reclaim`](crate::reclaim) module for the available strategies.
pub struct Table<R: Reclaim = Hazard> {
    pub(crate) raw: raw::Table<R>,
}

impl<R> Default for Table<R>
where
    R: Reclaim + Default,
{
    fn default() -> Self {
        Table::new()
    }
}

impl<R> Table<R>
where
    R: Reclaim + Default,
{
    /// Creates an empty `Table` with the default configuration of its strategy.
    ///
    /// # Examples
    ///
    /// ```
    /// use route_table::Table;
    /// let table: Table = Table::new();
    /// ```
    pub fn new() -> Table<R> {
        Table::with_strategy(R::default())
    }
}

impl<R: Reclaim> Table<R> {
    /// Creates an empty `Table` with the given strategy.
    ///
    /// # Examples
    ///
    /// ```
    /// use route_table::{reclaim::Hazard, Table};
    /// let table = Table::with_strategy(Hazard::new().batch_size(128));
    /// ```
    pub fn with_strategy(strategy: R) -> Table<R> {
        Table {
            raw: raw::Table::new(strategy),
        }
    }

    /// Returns a reference to the table's reclamation strategy.
    pub fn strategy(&self) -> &R {
        self.raw.reclaim()
    }

    /// Returns the value for the given key.
    ///
    /// Lookups never fail: races with concurrent writers are resolved internally by
    /// restarting the search.
    ///
    /// # Examples
    ///
    /// ```
    /// use route_table::Table;
    ///
    /// let table: Table = Table::new();
    /// table.add(0x0a000001, 3).unwrap();
    /// assert_eq!(table.lookup(0x0a000001), Some(3));
    /// assert_eq!(table.lookup(0x0a000002), None);
    /// ```
    #[inline]
    pub fn lookup(&self, key: u64) -> Option<u64> {
        self.raw.lookup(key)
    }

    /// Returns the value for the given key, or [`NOT_FOUND`] if it is not present.
    #[inline]
    pub fn lookup_raw(&self, key: u64) -> u64 {
        self.lookup(key).unwrap_or(NOT_FOUND)
    }

    /// Inserts a key-value pair into the table.
    ///
    /// The table does not check for an existing entry with the same key. While both
    /// are present, lookups and removals see the newer entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the entry could not be allocated, in which case
    /// the table is left unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use route_table::Table;
    ///
    /// let table: Table = Table::new();
    /// table.add(5, 50).unwrap();
    /// table.del(5).unwrap();
    /// table.add(5, 99).unwrap();
    /// assert_eq!(table.lookup(5), Some(99));
    /// ```
    pub fn add(&self, key: u64, value: u64) -> Result<(), Error> {
        self.raw.add(key, value)
    }

    /// Removes a key from the table.
    ///
    /// The entry is unlinked immediately. When its memory is returned to the allocator
    /// depends on the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key is not present.
    ///
    /// # Examples
    ///
    /// ```
    /// use route_table::{Error, Table};
    ///
    /// let table: Table = Table::new();
    /// table.add(1, 10).unwrap();
    /// assert_eq!(table.del(1), Ok(()));
    /// assert_eq!(table.del(1), Err(Error::NotFound));
    /// ```
    pub fn del(&self, key: u64) -> Result<(), Error> {
        self.raw.del(key)
    }

    /// Removes every entry from the table.
    pub fn clear(&self) {
        self.raw.clear()
    }

    /// Returns the number of entries in the table.
    ///
    /// This walks the entire chain while holding the write lock.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the table contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns allocation statistics for the entries of this table.
    ///
    /// Entries that were removed but are still waiting to be reclaimed count as live.
    pub fn stats(&self) -> Stats {
        self.raw.stats()
    }

    /// Registers the current thread with the table's strategy.
    ///
    /// Threads are registered lazily on first use, so calling this is optional. It may
    /// be used to move the setup cost out of a measured loop.
    pub fn register_thread(&self) {
        self.raw.register_thread()
    }

    /// Unregisters the current thread.
    ///
    /// Entries this thread removed that are not yet reclaimed are reclaimed now, or
    /// handed to another thread if they are still in use. A thread that uses the table
    /// again after unregistering is registered again.
    pub fn unregister_thread(&self) {
        self.raw.unregister_thread()
    }

    /// Marks a point at which the current thread holds no references into the table.
    ///
    /// Strategies that defer reclamation may use this as an opportunity to free removed
    /// entries.
    pub fn quiescent_state(&self) {
        self.raw.quiescent_state()
    }

    /// Registers the current thread, returning a guard that unregisters it when dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use route_table::Table;
    ///
    /// let table: Table = Table::new();
    /// std::thread::scope(|s| {
    ///     s.spawn(|| {
    ///         let _registration = table.register();
    ///         table.add(1, 10).unwrap();
    ///         assert_eq!(table.lookup(1), Some(10));
    ///     });
    /// });
    /// ```
    pub fn register(&self) -> Registration<'_, R> {
        self.register_thread();
        Registration {
            table: self,
            _unsend: PhantomData,
        }
    }
}

impl<R: Reclaim> fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A registered thread of a [`Table`].
///
/// Created by [`Table::register`]. The thread is unregistered when this guard is dropped.
#[must_use = "the thread is unregistered when the registration is dropped"]
pub struct Registration<'table, R: Reclaim> {
    table: &'table Table<R>,
    // Bound to the thread that registered.
    _unsend: PhantomData<*const ()>,
}

impl<R: Reclaim> Registration<'_, R> {
    /// Returns the table this thread is registered with.
    pub fn table(&self) -> &Table<R> {
        self.table
    }
}

impl<R: Reclaim> Drop for Registration<'_, R> {
    fn drop(&mut self) {
        self.table.unregister_thread();
    }
}

/// Allocation statistics of a [`Table`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// The number of entries ever allocated.
    pub allocated: usize,
    /// The number of entries returned to the allocator.
    pub freed: usize,
}

impl Stats {
    /// Returns the number of entries that have not been freed.
    pub fn live(&self) -> usize {
        self.allocated - self.freed
    }
}

/// The operations of a routing table, independent of its strategy.
///
/// This allows a harness to drive tables with different strategies through
/// `&dyn RouteTable`.
pub trait RouteTable: Send + Sync {
    /// See [`Table::lookup`].
    fn lookup(&self, key: u64) -> Option<u64>;

    /// See [`Table::add`].
    fn add(&self, key: u64, value: u64) -> Result<(), Error>;

    /// See [`Table::del`].
    fn del(&self, key: u64) -> Result<(), Error>;

    /// See [`Table::clear`].
    fn clear(&self);

    /// See [`Table::len`].
    fn len(&self) -> usize;

    /// See [`Table::stats`].
    fn stats(&self) -> Stats;

    /// See [`Table::register_thread`].
    fn register_thread(&self);

    /// See [`Table::unregister_thread`].
    fn unregister_thread(&self);

    /// See [`Table::quiescent_state`].
    fn quiescent_state(&self);

    /// Returns the name of the table's strategy.
    fn strategy_name(&self) -> &'static str;
}

impl<R: Reclaim> RouteTable for Table<R> {
    fn lookup(&self, key: u64) -> Option<u64> {
        Table::lookup(self, key)
    }

    fn add(&self, key: u64, value: u64) -> Result<(), Error> {
        Table::add(self, key, value)
    }

    fn del(&self, key: u64) -> Result<(), Error> {
        Table::del(self, key)
    }

    fn clear(&self) {
        Table::clear(self)
    }

    fn len(&self) -> usize {
        Table::len(self)
    }

    fn stats(&self) -> Stats {
        Table::stats(self)
    }

    fn register_thread(&self) {
        Table::register_thread(self)
    }

    fn unregister_thread(&self) {
        Table::unregister_thread(self)
    }

    fn quiescent_state(&self) {
        Table::quiescent_state(self)
    }

    fn strategy_name(&self) -> &'static str {
        R::NAME
    }
}
