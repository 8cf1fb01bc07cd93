//! Successor generation.
//!
//! `edges` runs the program from a state once per combination of choices,
//! with memory tracking on, and collects one candidate per run. Each run
//! executes a single thread, so every candidate belongs to a thread and
//! the footprints of all runs of that thread are merged.
//!
//! A candidate whose thread touched memory that another thread's runs
//! conflict with (a store against a load or store, in either direction)
//! is not yielded as is. Its choices are replayed with the conflicting
//! ranges marked critical: the first critical access still happens, the
//! second one preempts the run just before it. The state at the
//! preemption point is yielded instead, which exposes the interleavings
//! the other threads can make between the two accesses.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strata_heap::{CowHeap, HeapRead, Pointer, Snapshot};
use strata_table::{ConcurrentSet, TableConfig, TableHasher};
use strata_vm::{Choice, Context, ContextConfig, Footprint, MemMap, Program};
use tracing::{debug, info, trace};

use crate::hasher::SnapHasher;
use crate::label::Label;
use crate::solver::{NoSolver, Solver};
use crate::{BuildError, BuildResult};

/// A state of the explored program: a canonical snapshot from the table.
///
/// Two states are equal only if they are the same stored snapshot, which
/// for states handed out by one builder family means equal content.
#[derive(Debug, Clone)]
pub struct State {
    snap: Snapshot,
}

impl State {
    pub fn snapshot(&self) -> &Snapshot {
        &self.snap
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.snap.ptr_eq(&other.snap)
    }
}

impl Eq for State {}

impl Hash for State {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.snap.addr().hash(state);
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuilderConfig {
    /// Sizing of the snapshot table and the object pool.
    pub table: TableConfig,
    pub context: ContextConfig,
}

/// Totals shared by all clones of a builder. Each clone counts locally
/// and adds its counts here on [`Builder::sync`].
#[derive(Debug, Default)]
pub struct BuilderStats {
    instructions: AtomicU64,
    states: AtomicU64,
}

impl BuilderStats {
    pub fn instructions(&self) -> u64 {
        self.instructions.load(Ordering::Relaxed)
    }

    /// Distinct states stored, the initial state included.
    pub fn states(&self) -> u64 {
        self.states.load(Ordering::Relaxed)
    }
}

/// One run of `edges`, before interference is resolved.
struct Candidate {
    tid: Option<u32>,
    lock: Vec<Choice>,
    result: Option<(Snapshot, Label)>,
}

/// Builds the state graph of a program.
///
/// Clones share the program, the snapshot table, the object pool and the
/// statistics, but each has its own interpreter context, so one clone per
/// worker thread can generate successors in parallel.
pub struct Builder<P, S = NoSolver> {
    program: Arc<P>,
    ctx: Context,
    solver: S,
    hasher: SnapHasher<S>,
    states: ConcurrentSet<Snapshot>,
    initial: Snapshot,
    stats: Arc<BuilderStats>,
    local_instructions: u64,
    local_states: u64,
}

impl<P: Program> Builder<P, NoSolver> {
    /// Boot `program` and store its initial state.
    pub fn new(program: P, config: BuilderConfig) -> BuildResult<Self> {
        Self::with_solver(program, NoSolver, config)
    }
}

impl<P: Program, S: Solver> Builder<P, S> {
    pub fn with_solver(program: P, solver: S, config: BuilderConfig) -> BuildResult<Self> {
        let mut ctx = Context::new(CowHeap::new(config.table.clone()), config.context);
        ctx.set_booting(true);
        program.boot(&mut ctx)?;
        ctx.set_booting(false);
        if ctx.is_error() {
            return Err(BuildError::BootFailed {
                trace: ctx.trace_lines().join("; "),
            });
        }
        let root = ctx.root();
        if !ctx.heap().valid(root) {
            return Err(BuildError::InvalidState);
        }

        let snap = ctx.snapshot()?;
        let hasher = SnapHasher::new(root, solver.clone());
        let mut states = ConcurrentSet::new(config.table);
        let (initial, _) = states.insert(snap, &hasher)?;
        let stats = Arc::new(BuilderStats::default());
        stats.states.store(1, Ordering::Relaxed);
        info!(
            program = program.name(),
            objects = initial.len(),
            "booted"
        );

        Ok(Self {
            program: Arc::new(program),
            ctx,
            solver,
            hasher,
            states,
            initial,
            stats,
            local_instructions: 0,
            local_states: 0,
        })
    }

    pub fn program(&self) -> &P {
        &self.program
    }

    pub fn stats(&self) -> &Arc<BuilderStats> {
        &self.stats
    }

    /// The stored initial state.
    pub fn initial(&self) -> State {
        State {
            snap: self.initial.clone(),
        }
    }

    /// Yield the initial state.
    pub fn initials(&mut self, mut yield_state: impl FnMut(State)) {
        yield_state(self.initial());
    }

    /// Whether two snapshots are the same program state under this
    /// builder's equality policy.
    pub fn equal(&self, a: &Snapshot, b: &Snapshot) -> bool {
        self.hasher.equal(a, b)
    }

    /// The root object every state hangs from.
    pub fn root(&self) -> Pointer {
        self.hasher.root()
    }

    /// Number of distinct states stored so far.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Add the locally counted instructions and states to the shared
    /// totals.
    pub fn sync(&mut self) {
        self.stats
            .instructions
            .fetch_add(std::mem::take(&mut self.local_instructions), Ordering::Relaxed);
        self.stats
            .states
            .fetch_add(std::mem::take(&mut self.local_states), Ordering::Relaxed);
    }

    fn feasible(&mut self) -> bool {
        if self.ctx.is_cancelled() {
            return false;
        }
        match self.ctx.assume() {
            None => true,
            Some(assume) => self.solver.feasible(self.ctx.heap(), assume),
        }
    }

    fn run_once(&mut self, from: &State) -> BuildResult<()> {
        self.ctx.load(&from.snap);
        self.solver.reset();
        self.program.run(&mut self.ctx)?;
        self.local_instructions += self.ctx.instruction_count();
        Ok(())
    }

    fn capture(&mut self) -> BuildResult<Option<(Snapshot, Label)>> {
        if !self.feasible() {
            trace!(stack = ?self.ctx.consumed(), "infeasible run");
            return Ok(None);
        }
        let label = Label::from_context(&self.ctx);
        Ok(Some((self.ctx.snapshot()?, label)))
    }

    /// Store `snap` and hand the canonical state to the caller.
    fn store(
        &mut self,
        snap: Snapshot,
        label: Label,
        yield_edge: &mut impl FnMut(State, Label, bool),
    ) -> BuildResult<()> {
        let (snap, new) = self.states.insert(snap, &self.hasher)?;
        if new {
            self.local_states += 1;
        }
        yield_edge(State { snap }, label, new);
        Ok(())
    }

    /// Run every combination of choices from `from`, one candidate per run.
    fn collect(&mut self, from: &State) -> BuildResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        loop {
            self.run_once(from)?;
            let result = self.capture()?;
            candidates.push(Candidate {
                tid: self.ctx.tid(),
                lock: self.ctx.consumed().to_vec(),
                result,
            });
            if self.ctx.finished() {
                return Ok(candidates);
            }
        }
    }

    /// Ranges that another thread's runs conflict with: `(loads, stores)`
    /// to mark critical when replaying a run of `tid`.
    fn conflicts(critical: &BTreeMap<u32, Footprint>, tid: u32) -> (MemMap, MemMap) {
        let mut loads = MemMap::new();
        let mut stores = MemMap::new();
        let Some(us) = critical.get(&tid) else {
            return (loads, stores);
        };
        for (_, them) in critical.iter().filter(|(t, _)| **t != tid) {
            for (obj, s, e) in them.loads.iter() {
                if us.stores.intersect(obj, s, e) {
                    stores.insert(obj, s, e);
                }
            }
            for (obj, s, e) in them.stores.iter() {
                if us.loads.intersect(obj, s, e) {
                    loads.insert(obj, s, e);
                }
                if us.stores.intersect(obj, s, e) {
                    stores.insert(obj, s, e);
                }
            }
        }
        (loads, stores)
    }

    /// Generate every successor of `from`. `yield_edge` receives the
    /// canonical successor, the transition label and whether the successor
    /// was seen for the first time.
    pub fn edges(
        &mut self,
        from: &State,
        mut yield_edge: impl FnMut(State, Label, bool),
    ) -> BuildResult<()> {
        if !from.snap.valid(self.hasher.root()) {
            return Err(BuildError::InvalidState);
        }

        self.ctx.clear_critical();
        self.ctx.clear_crit();
        self.ctx.reset_choices();
        self.ctx.set_tracking(true);
        let candidates = self.collect(from);
        self.ctx.set_tracking(false);
        let candidates = candidates?;

        let critical = self.ctx.critical().clone();
        let (mut yielded, mut reruns) = (0usize, 0usize);
        for cand in candidates {
            let (loads, stores) = match cand.tid {
                Some(tid) => Self::conflicts(&critical, tid),
                None => (MemMap::new(), MemMap::new()),
            };

            if loads.is_empty() && stores.is_empty() {
                if let Some((snap, label)) = cand.result {
                    self.store(snap, label, &mut yield_edge)?;
                    yielded += 1;
                }
                continue;
            }

            reruns += 1;
            self.ctx.reset_choices();
            self.ctx.set_lock(cand.lock.iter().copied());
            self.ctx.set_critical(loads, stores);
            let rerun = self.run_once(from).and_then(|()| self.capture());
            self.ctx.clear_crit();
            let ran = self.ctx.consumed().to_vec();
            self.ctx.reset_choices();

            if let Some((snap, label)) = rerun? {
                if !cand.lock.starts_with(&ran) {
                    return Err(BuildError::LockMismatch {
                        lock: cand.lock,
                        ran,
                    });
                }
                self.store(snap, label, &mut yield_edge)?;
                yielded += 1;
            }
        }

        self.ctx.clear_critical();
        debug!(yielded, reruns, "edges");
        Ok(())
    }
}

impl<P, S: Clone> Clone for Builder<P, S> {
    fn clone(&self) -> Self {
        Self {
            program: Arc::clone(&self.program),
            ctx: self.ctx.clone(),
            solver: self.solver.clone(),
            hasher: self.hasher.clone(),
            states: self.states.clone(),
            initial: self.initial.clone(),
            stats: Arc::clone(&self.stats),
            local_instructions: 0,
            local_states: 0,
        }
    }
}

impl<P, S> std::fmt::Debug for Builder<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("states", &self.states.len())
            .field("local_instructions", &self.local_instructions)
            .field("local_states", &self.local_states)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_vm::models;

    #[test]
    fn test_empty_state_is_invalid() {
        let mut b = Builder::new(models::choice(), BuilderConfig::default()).unwrap();
        let bogus = State {
            snap: Snapshot::empty(),
        };
        assert!(matches!(
            b.edges(&bogus, |_, _, _| {}),
            Err(BuildError::InvalidState)
        ));
    }

    #[test]
    fn test_conflicts() {
        let mut critical = BTreeMap::new();
        let mut us = Footprint::default();
        us.loads.insert(1, 0, 4);
        us.stores.insert(1, 8, 12);
        let mut them = Footprint::default();
        them.loads.insert(1, 8, 10);
        them.stores.insert(1, 2, 6);
        them.stores.insert(2, 0, 4);
        critical.insert(0, us);
        critical.insert(1, them);

        let (loads, stores) = Builder::<strata_vm::machine::Machine>::conflicts(&critical, 0);
        assert_eq!(loads.iter().collect::<Vec<_>>(), vec![(1, 2, 6)]);
        assert_eq!(stores.iter().collect::<Vec<_>>(), vec![(1, 8, 10)]);

        let (loads, stores) = Builder::<strata_vm::machine::Machine>::conflicts(&critical, 7);
        assert!(loads.is_empty() && stores.is_empty());
    }

    #[test]
    fn test_sync_flushes_counts() {
        let mut b = Builder::new(models::choice(), BuilderConfig::default()).unwrap();
        let init = b.initial();
        b.edges(&init, |_, _, _| {}).unwrap();
        assert_eq!(b.stats().instructions(), 0);
        b.sync();
        assert_eq!(b.stats().states(), 4);
        assert!(b.stats().instructions() > 0);
        b.sync();
        assert_eq!(b.stats().states(), 4);
    }
}
