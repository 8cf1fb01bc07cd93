//! Copy-on-write heap and snapshots.
//!
//! A [`Snapshot`] is an immutable, sorted log of `(id, object)` entries.
//! [`CowHeap`] reads through its current snapshot and keeps every change made
//! since then in a small exception map; taking a snapshot merges exceptions
//! into a new log, reusing the entries of untouched objects. Objects entering
//! a log are interned in a concurrent set shared by all heaps cloned from
//! the same pool, so equal object states share storage and snapshots of equal
//! heaps usually consist of pointer-identical entries.
//!
//! Freed identifiers stay in the snapshot as tombstones, so a dangling
//! pointer keeps faulting and its identifier is never handed out again by
//! heaps restored from that snapshot.

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use strata_table::{ConcurrentSet, TableConfig, TableHasher, TableResult};
use tracing::trace;

use crate::heap::{Heap, HeapRead};
use crate::object::Object;

#[derive(Debug, Clone)]
struct SnapItem {
    id: u32,
    obj: Arc<Object>,
}

/// An immutable captured heap state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Snapshot {
    log: Arc<[SnapItem]>,
    /// Freed identifiers, ascending.
    freed: Arc<[u32]>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            log: Arc::from(Vec::new()),
            freed: Arc::from(Vec::new()),
        }
    }

    /// Number of objects in the snapshot.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Whether both handles refer to the same log.
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.log, &other.log)
    }

    /// Identity of the underlying log, for pointer-based hashing.
    pub fn addr(&self) -> usize {
        self.log.as_ptr() as usize
    }

    /// Entry-wise comparison by object identity. Snapshots with identical
    /// logs are equal; the converse does not hold.
    pub fn same_log(&self, other: &Snapshot) -> bool {
        self.ptr_eq(other)
            || (self.log.len() == other.log.len()
                && self
                    .log
                    .iter()
                    .zip(other.log.iter())
                    .all(|(a, b)| a.id == b.id && Arc::ptr_eq(&a.obj, &b.obj)))
    }

    fn find(&self, id: u32) -> Option<&Arc<Object>> {
        self.log
            .binary_search_by_key(&id, |item| item.id)
            .ok()
            .map(|i| &self.log[i].obj)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl HeapRead for Snapshot {
    fn object(&self, id: u32) -> Option<&Object> {
        self.find(id).map(|obj| &**obj)
    }

    fn freed(&self, id: u32) -> bool {
        self.freed.binary_search(&id).is_ok()
    }

    fn object_count(&self) -> usize {
        self.log.len()
    }
}

/// Hashing policy for interned objects.
#[derive(Clone)]
struct ObjectHasher {
    state: ahash::RandomState,
}

impl ObjectHasher {
    fn new() -> Self {
        Self {
            state: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }
}

impl TableHasher<Arc<Object>> for ObjectHasher {
    fn hash(&self, obj: &Arc<Object>) -> u64 {
        let mut h = self.state.build_hasher();
        obj.hash(&mut h);
        std::hash::Hasher::finish(&h)
    }

    fn equal(&self, a: &Arc<Object>, b: &Arc<Object>) -> bool {
        Arc::ptr_eq(a, b) || **a == **b
    }
}

/// A heap that layers mutations over a [`Snapshot`].
///
/// Cloning gives an independent heap over the same object pool; clones may
/// be moved to other threads.
#[derive(Clone)]
pub struct CowHeap {
    snap: Snapshot,
    /// Changes since `snap` was taken or restored; `None` marks a freed id.
    exceptions: BTreeMap<u32, Option<Arc<Object>>>,
    pool: ConcurrentSet<Arc<Object>>,
    hasher: ObjectHasher,
}

impl CowHeap {
    pub fn new(config: TableConfig) -> Self {
        Self {
            snap: Snapshot::empty(),
            exceptions: BTreeMap::new(),
            pool: ConcurrentSet::new(config),
            hasher: ObjectHasher::new(),
        }
    }

    /// Whether anything changed since the last snapshot or restore.
    pub fn is_dirty(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// Number of distinct object states interned in the pool.
    pub fn interned(&self) -> usize {
        self.pool.len()
    }

    /// Capture the current state. Untouched objects are shared with the
    /// previous log; changed objects are interned.
    pub fn snapshot(&mut self) -> TableResult<Snapshot> {
        if self.exceptions.is_empty() {
            return Ok(self.snap.clone());
        }

        let mut log = Vec::with_capacity(self.snap.len() + self.exceptions.len());
        let mut base = self.snap.log.iter().peekable();
        let exceptions = std::mem::take(&mut self.exceptions);
        let touched = exceptions.len();
        let mut tombstones = Vec::new();

        for (id, change) in exceptions {
            while let Some(item) = base.next_if(|item| item.id < id) {
                log.push(item.clone());
            }
            let _ = base.next_if(|item| item.id == id);
            match change {
                Some(obj) => {
                    let (obj, _) = self.pool.insert(obj, &self.hasher)?;
                    log.push(SnapItem { id, obj });
                }
                None => tombstones.push(id),
            }
        }
        log.extend(base.cloned());

        let freed = if tombstones.is_empty() {
            Arc::clone(&self.snap.freed)
        } else {
            let mut freed = self.snap.freed.to_vec();
            freed.extend(tombstones);
            freed.sort_unstable();
            freed.dedup();
            Arc::from(freed)
        };

        trace!(objects = log.len(), freed = freed.len(), touched, "snapshot taken");
        self.snap = Snapshot {
            log: Arc::from(log),
            freed,
        };
        Ok(self.snap.clone())
    }

    /// Make `snap` the current state, discarding uncommitted changes.
    pub fn restore(&mut self, snap: &Snapshot) {
        self.snap = snap.clone();
        self.exceptions.clear();
    }
}

impl std::fmt::Debug for CowHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowHeap")
            .field("objects", &self.snap.len())
            .field("exceptions", &self.exceptions.len())
            .finish()
    }
}

impl HeapRead for CowHeap {
    fn object(&self, id: u32) -> Option<&Object> {
        match self.exceptions.get(&id) {
            Some(change) => change.as_deref(),
            None => self.snap.object(id),
        }
    }

    fn freed(&self, id: u32) -> bool {
        match self.exceptions.get(&id) {
            Some(change) => change.is_none(),
            None => self.snap.freed(id),
        }
    }

    fn object_count(&self) -> usize {
        let mut count = self.snap.len();
        for (id, change) in &self.exceptions {
            match (self.snap.find(*id).is_some(), change.is_some()) {
                (true, false) => count -= 1,
                (false, true) => count += 1,
                _ => {}
            }
        }
        count
    }
}

impl Heap for CowHeap {
    fn object_mut(&mut self, id: u32) -> Option<&mut Object> {
        if !self.exceptions.contains_key(&id) {
            let obj = self.snap.find(id)?.clone();
            self.exceptions.insert(id, Some(obj));
        }
        self.exceptions
            .get_mut(&id)
            .and_then(|change| change.as_mut())
            .map(Arc::make_mut)
    }

    fn insert_object(&mut self, id: u32, obj: Object) {
        self.exceptions.insert(id, Some(Arc::new(obj)));
    }

    fn remove_object(&mut self, id: u32) -> bool {
        if self.object(id).is_none() {
            return false;
        }
        self.exceptions.insert(id, None);
        true
    }
}
