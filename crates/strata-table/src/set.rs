//! Lock-free concurrent hash set built from rows of doubling size.
//!
//! Only the current row accepts inserts. When it fills up, one thread wins
//! the right to grow: it allocates the next row and publishes it, then every
//! thread that notices the growth helps migrate segments of the old row
//! into the new one. Migration invalidates each old slot before copying it,
//! so any operation that races with it observes either the old slot or an
//! invalid marker that sends it to retry on the new row.
//!
//! Rows are reference counted by the handles working on them; a row is
//! freed when the last handle moves away and the migration that drained it
//! has finished.

use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::cell::{Cell, Probe};
use crate::TableHasher;

/// Number of slots each migration work unit covers.
const SEGMENT_SIZE: usize = 1 << 16;

/// Upper bound on probes per lookup in a row.
const MAX_COLLISIONS: usize = 1 << 16;

const IDLE: u8 = 0;
const GROWING: u8 = 1;
const MIGRATING: u8 = 2;

/// Table error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("table out of growth space after {grows} growth steps")]
    OutOfGrowthSpace { grows: usize },
}

pub type TableResult<T> = Result<T, TableError>;

/// Configuration for a [`ConcurrentSet`].
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Number of slots in the first row (rounded up to a power of two).
    pub initial_size: usize,
    /// Maximum number of times the table may double in size.
    pub max_grows: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            initial_size: 1 << 10,
            max_grows: 32,
        }
    }
}

/// Resolution of a single probe pass over one row.
enum Resolution<'a, T> {
    /// The value was stored in this slot.
    Success(&'a Cell<T>),
    /// An equal value already lives in this slot.
    Found(&'a Cell<T>),
    NotFound,
    /// The row is too full; the table must grow.
    NoSpace(T),
    /// The row is being replaced; help and retry.
    Growing(Option<T>),
}

struct Row<T> {
    cells: Box<[Cell<T>]>,
}

impl<T> Row<T> {
    fn new(size: usize) -> Self {
        Self {
            cells: (0..size).map(|_| Cell::new()).collect(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.cells.len()
    }

    /// Triangular probing; visits every slot of a power-of-two row.
    #[inline]
    fn slot(&self, hash: u64, attempt: usize) -> &Cell<T> {
        let mask = self.cells.len() - 1;
        let idx = (hash as usize).wrapping_add(attempt * (attempt + 1) / 2) & mask;
        &self.cells[idx]
    }

    /// Insert without comparing against existing values. Only used during
    /// migration, when every incoming value is known to be distinct and no
    /// other thread inserts into this row.
    fn force_insert(&self, mut value: T, hash: u64) {
        for attempt in 0..self.len() {
            match self.slot(hash, attempt).try_store(value, hash) {
                Ok(()) => return,
                Err(v) => value = v,
            }
        }
        unreachable!("migration target row has no free slot");
    }
}

struct RowSlot<T> {
    row: AtomicPtr<Row<T>>,
    /// Handles working on this row, plus one held by the table while the row
    /// is current or being drained.
    workers: AtomicUsize,
}

struct Shared<T> {
    rows: Box<[RowSlot<T>]>,
    current: AtomicUsize,
    phase: AtomicU8,
    /// Segments of the old row not yet claimed by a migrating thread.
    available: AtomicIsize,
    /// Segments of the old row whose migration has completed.
    done: AtomicUsize,
    segments: AtomicUsize,
    used: AtomicUsize,
    grows: AtomicUsize,
}

// SAFETY: row memory is only reached through `RowSlot` pointers guarded by
// the worker counts; cells themselves are Sync for Send + Sync values.
unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new(config: &TableConfig) -> Self {
        let rows: Box<[RowSlot<T>]> = (0..=config.max_grows)
            .map(|_| RowSlot {
                row: AtomicPtr::new(ptr::null_mut()),
                workers: AtomicUsize::new(0),
            })
            .collect();
        let size = config.initial_size.max(2).next_power_of_two();
        rows[0]
            .row
            .store(Box::into_raw(Box::new(Row::new(size))), Ordering::Release);
        rows[0].workers.store(1, Ordering::Release);
        Self {
            rows,
            current: AtomicUsize::new(0),
            phase: AtomicU8::new(IDLE),
            available: AtomicIsize::new(0),
            done: AtomicUsize::new(0),
            segments: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            grows: AtomicUsize::new(0),
        }
    }

    /// The row at `index`. The caller must hold a worker reference on it,
    /// or be migrating it while the table still holds its own reference.
    #[inline]
    fn row(&self, index: usize) -> &Row<T> {
        let p = self.rows[index].row.load(Ordering::Acquire);
        debug_assert!(!p.is_null());
        // SAFETY: see above; the pointer stays valid until workers hits zero.
        unsafe { &*p }
    }

    #[inline]
    fn changed(&self, index: usize) -> bool {
        index < self.current.load(Ordering::SeqCst) || self.phase.load(Ordering::SeqCst) != IDLE
    }

    fn acquire(&self) -> usize {
        let mut index = self.current.load(Ordering::SeqCst);
        loop {
            let workers = &self.rows[index].workers;
            let count = workers.load(Ordering::SeqCst);
            if count == 0 {
                index = self.current.load(Ordering::SeqCst);
                continue;
            }
            if workers
                .compare_exchange_weak(count, count + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return index;
            }
        }
    }

    fn release(&self, index: usize) {
        if self.rows[index].workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let p = self.rows[index].row.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                // SAFETY: the last reference is gone; nobody can reach the row.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }

    fn find_cell<H: TableHasher<T>>(
        &self,
        value: &T,
        hash: u64,
        index: usize,
        hasher: &H,
    ) -> Resolution<'_, T> {
        if self.changed(index) {
            return Resolution::Growing(None);
        }
        let row = self.row(index);
        for attempt in 0..MAX_COLLISIONS.min(row.len()) {
            if self.changed(index) {
                return Resolution::Growing(None);
            }
            let cell = row.slot(hash, attempt);
            match cell.probe(hash) {
                Probe::Empty => return Resolution::NotFound,
                Probe::Invalid => return Resolution::Growing(None),
                Probe::Match if hasher.equal(cell.value(), value) => {
                    return Resolution::Found(cell)
                }
                Probe::Match | Probe::Other => {}
            }
        }
        Resolution::NotFound
    }

    fn insert_cell<H: TableHasher<T>>(
        &self,
        mut value: T,
        hash: u64,
        index: usize,
        hasher: &H,
    ) -> Resolution<'_, T> {
        if self.changed(index) {
            return Resolution::Growing(Some(value));
        }
        let row = self.row(index);
        // usage above 75% of the row
        if row.len() * 3 <= self.used.load(Ordering::Relaxed) * 4 {
            return Resolution::NoSpace(value);
        }

        for attempt in 0..MAX_COLLISIONS.min(row.len()) {
            let cell = row.slot(hash, attempt);
            if cell.is_empty() {
                match cell.try_store(value, hash) {
                    Ok(()) => return Resolution::Success(cell),
                    Err(v) => value = v,
                }
            }
            match cell.probe(hash) {
                Probe::Invalid => return Resolution::Growing(Some(value)),
                Probe::Match if hasher.equal(cell.value(), &value) => {
                    return Resolution::Found(cell)
                }
                _ => {}
            }
            if self.changed(index) {
                return Resolution::Growing(Some(value));
            }
        }
        Resolution::NoSpace(value)
    }

    /// Try to become the grower of row `from + 1`. Returns `Ok(false)` when
    /// another thread is growing or already has grown past `from`.
    fn grow(&self, from: usize) -> TableResult<bool>
    where
        T: Clone,
    {
        if self.current.load(Ordering::SeqCst) > from {
            return Ok(false);
        }
        if self
            .phase
            .compare_exchange(IDLE, GROWING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        if self.current.load(Ordering::SeqCst) > from {
            self.phase.store(IDLE, Ordering::SeqCst);
            return Ok(false);
        }

        let next = from + 1;
        if next >= self.rows.len() {
            self.phase.store(IDLE, Ordering::SeqCst);
            error!(grows = from, "concurrent table out of growth space");
            return Err(TableError::OutOfGrowthSpace { grows: from });
        }

        let old_size = self.row(from).len();
        let new_size = old_size * 2;
        self.rows[next].row.store(
            Box::into_raw(Box::new(Row::new(new_size))),
            Ordering::Release,
        );
        self.rows[next].workers.store(1, Ordering::SeqCst);

        let segments = (old_size / SEGMENT_SIZE).max(1);
        self.segments.store(segments, Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        // publish the row before any segment can be claimed
        self.current.store(next, Ordering::SeqCst);
        self.available.store(segments as isize, Ordering::SeqCst);
        self.grows.fetch_add(1, Ordering::Relaxed);
        debug!(row = next, size = new_size, segments, "growing concurrent table");
        self.phase.store(MIGRATING, Ordering::SeqCst);

        while self.migrate_segment() {}
        Ok(true)
    }

    /// Migrate one segment of the old row. Returns false once there is no
    /// more unclaimed work.
    fn migrate_segment(&self) -> bool
    where
        T: Clone,
    {
        if self.available.load(Ordering::SeqCst) <= 0 {
            return false;
        }
        let segment = self.available.fetch_sub(1, Ordering::SeqCst) - 1;
        if segment < 0 {
            return false;
        }
        let segment = segment as usize;

        let current = self.current.load(Ordering::SeqCst);
        let old = self.row(current - 1);
        let new = self.row(current);
        let start = segment * SEGMENT_SIZE;
        let end = (start + SEGMENT_SIZE).min(old.len());

        // every slot has to be invalidated, empty ones included
        for cell in &old.cells[start..end] {
            if let Some((value, hash)) = cell.invalidate() {
                new.force_insert(value.clone(), hash);
            }
        }

        if self.done.fetch_add(1, Ordering::SeqCst) + 1 == self.segments.load(Ordering::SeqCst) {
            self.release(current - 1);
            self.phase.store(IDLE, Ordering::SeqCst);
        }
        segment > 0
    }

    fn help(&self)
    where
        T: Clone,
    {
        loop {
            match self.phase.load(Ordering::SeqCst) {
                IDLE => return,
                MIGRATING => while self.migrate_segment() {},
                _ => {}
            }
            std::hint::spin_loop();
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        for slot in self.rows.iter() {
            let p = slot.row.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                // SAFETY: exclusive access; no handle outlives the shared state.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

/// A handle to a lock-free concurrent hash set.
///
/// Each thread works through its own handle (obtained by cloning), which
/// pins the row it last used. Values are cloned out of the table, so `T`
/// should be cheap to clone (an `Arc` or a small `Copy` type).
pub struct ConcurrentSet<T> {
    shared: Arc<Shared<T>>,
    row: usize,
}

impl<T: Clone + Send + Sync> ConcurrentSet<T> {
    pub fn new(config: TableConfig) -> Self {
        let shared = Arc::new(Shared::new(&config));
        let row = shared.acquire();
        Self { shared, row }
    }

    /// Move this handle to the current row if it has fallen behind.
    fn update_row(&mut self) {
        let current = self.shared.current.load(Ordering::SeqCst);
        if current != self.row {
            let next = self.shared.acquire();
            self.shared.release(self.row);
            self.row = next;
        }
    }

    /// Insert `value` unless an equal one is present. Returns the canonical
    /// value and whether it was newly inserted.
    pub fn insert<H: TableHasher<T>>(&mut self, value: T, hasher: &H) -> TableResult<(T, bool)> {
        let hash = hasher.hash(&value);
        self.insert_hinted(value, hash, hasher)
    }

    /// Like [`insert`](Self::insert), with a precomputed hash.
    pub fn insert_hinted<H: TableHasher<T>>(
        &mut self,
        mut value: T,
        hash: u64,
        hasher: &H,
    ) -> TableResult<(T, bool)> {
        loop {
            match self.shared.insert_cell(value, hash, self.row, hasher) {
                Resolution::Success(cell) => {
                    self.shared.used.fetch_add(1, Ordering::Relaxed);
                    return Ok((cell.value().clone(), true));
                }
                Resolution::Found(cell) => return Ok((cell.value().clone(), false)),
                Resolution::NoSpace(v) => {
                    value = v;
                    if !self.shared.grow(self.row)? {
                        self.shared.help();
                    }
                    self.update_row();
                }
                Resolution::Growing(v) => {
                    value = match v {
                        Some(v) => v,
                        None => unreachable!("insert lost its value"),
                    };
                    self.shared.help();
                    self.update_row();
                }
                Resolution::NotFound => unreachable!("insert cannot resolve to NotFound"),
            }
        }
    }

    /// Look up the stored value equal to `value`.
    pub fn find<H: TableHasher<T>>(&mut self, value: &T, hasher: &H) -> Option<T> {
        let hash = hasher.hash(value);
        loop {
            match self.shared.find_cell(value, hash, self.row, hasher) {
                Resolution::Found(cell) => return Some(cell.value().clone()),
                Resolution::NotFound => return None,
                _ => {
                    self.shared.help();
                    self.update_row();
                }
            }
        }
    }

    /// Number of distinct values stored.
    pub fn len(&self) -> usize {
        self.shared.used.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed growth steps.
    pub fn grows(&self) -> usize {
        self.shared.grows.load(Ordering::Relaxed)
    }

    /// Slot count of the current row.
    pub fn capacity(&mut self) -> usize {
        self.shared.help();
        self.update_row();
        self.shared.row(self.row).len()
    }

    /// Collect every stored value. Not meant to run concurrently with inserts.
    pub fn values(&mut self) -> Vec<T> {
        self.shared.help();
        self.update_row();
        self.shared
            .row(self.row)
            .cells
            .iter()
            .filter_map(|c| c.live().cloned())
            .collect()
    }
}

impl<T: Clone + Send + Sync> Clone for ConcurrentSet<T> {
    fn clone(&self) -> Self {
        let row = self.shared.acquire();
        Self {
            shared: Arc::clone(&self.shared),
            row,
        }
    }
}

impl<T> Drop for ConcurrentSet<T> {
    fn drop(&mut self) {
        self.shared.release(self.row);
    }
}

impl<T> std::fmt::Debug for ConcurrentSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentSet")
            .field("len", &self.shared.used.load(Ordering::Relaxed))
            .field("row", &self.row)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    impl TableHasher<u64> for Identity {
        fn hash(&self, v: &u64) -> u64 {
            v.wrapping_mul(0x9e3779b97f4a7c15)
        }
        fn equal(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    /// Every value hashes the same; exercises long probe chains.
    struct Colliding;

    impl TableHasher<u64> for Colliding {
        fn hash(&self, _: &u64) -> u64 {
            0xabcd_0000
        }
        fn equal(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    fn small() -> TableConfig {
        TableConfig {
            initial_size: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_find() {
        let mut set = ConcurrentSet::new(small());
        assert_eq!(set.insert(42, &Identity).unwrap(), (42, true));
        assert_eq!(set.insert(99, &Identity).unwrap(), (99, true));
        assert_eq!(set.insert(42, &Identity).unwrap(), (42, false));
        assert_eq!(set.find(&42, &Identity), Some(42));
        assert_eq!(set.find(&7, &Identity), None);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_growth_keeps_entries() {
        let mut set = ConcurrentSet::new(small());
        for i in 0..1000u64 {
            assert!(set.insert(i, &Identity).unwrap().1);
        }
        assert!(set.grows() >= 5);
        assert!(set.capacity() >= 1024);
        for i in 0..1000u64 {
            assert_eq!(set.find(&i, &Identity), Some(i));
            assert!(!set.insert(i, &Identity).unwrap().1);
        }
        assert_eq!(set.len(), 1000);
        assert_eq!(set.values().len(), 1000);
    }

    #[test]
    fn test_colliding_hashes() {
        let mut set = ConcurrentSet::new(small());
        for i in 0..40u64 {
            assert!(set.insert(i, &Colliding).unwrap().1);
        }
        for i in 0..40u64 {
            assert_eq!(set.find(&i, &Colliding), Some(i));
        }
    }

    #[test]
    fn test_out_of_growth_space() {
        let mut set = ConcurrentSet::new(TableConfig {
            initial_size: 4,
            max_grows: 1,
        });
        let mut result = Ok((0, true));
        for i in 0..64u64 {
            result = set.insert(i, &Identity);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(TableError::OutOfGrowthSpace { grows: 1 }));
    }

    #[test]
    fn test_handles_share_content() {
        let mut a = ConcurrentSet::new(small());
        let mut b = a.clone();
        a.insert(5, &Identity).unwrap();
        for i in 100..200u64 {
            b.insert(i, &Identity).unwrap();
        }
        // `a` still pins the first row and must catch up
        assert_eq!(a.find(&150, &Identity), Some(150));
        assert_eq!(b.find(&5, &Identity), Some(5));
    }

    #[test]
    fn test_values_are_dropped() {
        let marker = Arc::new(());
        {
            struct ByPtr;
            impl TableHasher<Arc<()>> for ByPtr {
                fn hash(&self, v: &Arc<()>) -> u64 {
                    Arc::as_ptr(v) as u64
                }
                fn equal(&self, a: &Arc<()>, b: &Arc<()>) -> bool {
                    Arc::ptr_eq(a, b)
                }
            }
            let mut set = ConcurrentSet::new(small());
            set.insert(Arc::clone(&marker), &ByPtr).unwrap();
            assert_eq!(Arc::strong_count(&marker), 2);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_growth_moves_owned_values() {
        struct ByContent;
        impl TableHasher<Arc<String>> for ByContent {
            fn hash(&self, v: &Arc<String>) -> u64 {
                v.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
                    (h ^ u64::from(b)).wrapping_mul(0x100_0000_01b3)
                })
            }
            fn equal(&self, a: &Arc<String>, b: &Arc<String>) -> bool {
                a == b
            }
        }

        let values: Vec<Arc<String>> = (0..300).map(|i| Arc::new(format!("v{i}"))).collect();
        {
            let mut set = ConcurrentSet::new(small());
            for v in &values {
                assert!(set.insert(Arc::clone(v), &ByContent).unwrap().1);
            }
            assert!(set.grows() > 0);
            for v in &values {
                let found = set.find(&Arc::new(v.to_string()), &ByContent).unwrap();
                assert!(Arc::ptr_eq(&found, v));
            }
        }
        assert!(values.iter().all(|v| Arc::strong_count(v) == 1));
    }
}
