//! Hash and equality of whole program states.

use std::cmp::Ordering;

use strata_heap::{compare_with, hash, Pointer, Snapshot};
use strata_table::TableHasher;

use crate::solver::Solver;

/// [`TableHasher`] for snapshots: structural hash and comparison of the
/// graph reachable from the state root.
#[derive(Debug, Clone)]
pub struct SnapHasher<S> {
    root: Pointer,
    solver: S,
}

impl<S: Solver> SnapHasher<S> {
    pub fn new(root: Pointer, solver: S) -> Self {
        Self { root, solver }
    }

    pub fn root(&self) -> Pointer {
        self.root
    }

    /// Ordering and the symbolic value pairs met along the way.
    fn compare(&self, a: &Snapshot, b: &Snapshot) -> (Ordering, Vec<(Pointer, Pointer)>) {
        let mut pairs = Vec::new();
        let ord = compare_with(a, b, self.root, self.root, &mut |x, y| pairs.push((x, y)));
        (ord, pairs)
    }
}

impl<S: Solver> TableHasher<Snapshot> for SnapHasher<S> {
    fn hash(&self, snap: &Snapshot) -> u64 {
        let h = hash(snap, self.root);
        (h >> 64) as u64 ^ h as u64
    }

    fn equal(&self, a: &Snapshot, b: &Snapshot) -> bool {
        if a.same_log(b) {
            return true;
        }
        let (ord, pairs) = self.compare(a, b);
        if ord.is_ne() {
            return false;
        }
        if pairs.is_empty() {
            return true;
        }
        if S::SYMBOLIC {
            self.solver.equal(&pairs, a, b)
        } else {
            pairs.iter().all(|(x, y)| x == y)
        }
    }
}
