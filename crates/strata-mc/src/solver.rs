//! Boundary to the path-condition solver.

use strata_heap::{CowHeap, Pointer, Snapshot};

/// Feasibility and equality queries over symbolic values.
///
/// A builder is generic over its solver, so whether snapshots are compared
/// explicitly or symbolically is fixed for the builder's lifetime.
pub trait Solver: Clone + Send + Sync {
    /// Whether marked pointers are symbolic values whose equality is
    /// decided by [`Solver::equal`]. When false they are compared by
    /// identifier.
    const SYMBOLIC: bool;

    /// Drop any per-run state. Called before every run.
    fn reset(&mut self) {}

    /// Whether the path condition `assume` is satisfiable in `heap`.
    fn feasible(&mut self, heap: &CowHeap, assume: Pointer) -> bool;

    /// Whether each pair of symbolic values is equal, the first taken in
    /// `a` and the second in `b`.
    fn equal(&self, pairs: &[(Pointer, Pointer)], a: &Snapshot, b: &Snapshot) -> bool;
}

/// Explicit-state solver: every path is feasible and snapshots must match
/// exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSolver;

impl Solver for NoSolver {
    const SYMBOLIC: bool = false;

    fn feasible(&mut self, _heap: &CowHeap, _assume: Pointer) -> bool {
        true
    }

    fn equal(&self, pairs: &[(Pointer, Pointer)], _a: &Snapshot, _b: &Snapshot) -> bool {
        pairs.iter().all(|(x, y)| x == y)
    }
}
