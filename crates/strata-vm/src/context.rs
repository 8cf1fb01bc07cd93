//! Execution context shared by the interpreter and the state-space builder.
//!
//! Choices made during a run are recorded on a stack of [`Choice`]s. After
//! a run, [`Context::finished`] advances the stack to the next unexplored
//! sibling, so repeating load-run-finished until it returns true visits
//! every combination of choices once. A `lock` queue forces a prefix of
//! choices, which is how a particular run is replayed.

use std::collections::{BTreeMap, VecDeque};

use strata_heap::{CowHeap, Heap, HeapRead, Pointer, Snapshot, Value};
use strata_table::TableResult;
use tracing::{trace, warn};

use crate::memmap::{Footprint, MemMap};
use crate::{Choice, Fault, Interrupt, InterruptKind, VmError, VmResult};

/// What happens to a run after it faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Stop the run; the state reached so far is still a successor.
    #[default]
    EndRun,
    /// Record the fault and keep interpreting.
    Continue,
}

#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    pub fault_policy: FaultPolicy,
}

/// Outcome of a tracked memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access<T> {
    Done(T),
    /// The access was not performed; the run must stop before it.
    Preempted,
}

#[derive(Debug, Clone)]
pub struct Context {
    heap: CowHeap,
    config: ContextConfig,
    root: Pointer,
    assume: Option<Pointer>,

    stack: Vec<Choice>,
    level: usize,
    lock: VecDeque<Choice>,
    booting: bool,

    trace: Vec<String>,
    interrupts: Vec<Interrupt>,
    accepting: bool,
    error: bool,
    cancel: bool,
    instructions: u64,
    tid: Option<u32>,
    pc: u32,

    tracking: bool,
    critical: BTreeMap<u32, Footprint>,
    crit_loads: MemMap,
    crit_stores: MemMap,
    crit_hit: bool,
    preempted: bool,
}

impl Context {
    pub fn new(heap: CowHeap, config: ContextConfig) -> Self {
        Self {
            heap,
            config,
            root: Pointer::NULL,
            assume: None,
            stack: Vec::new(),
            level: 0,
            lock: VecDeque::new(),
            booting: false,
            trace: Vec::new(),
            interrupts: Vec::new(),
            accepting: false,
            error: false,
            cancel: false,
            instructions: 0,
            tid: None,
            pc: 0,
            tracking: false,
            critical: BTreeMap::new(),
            crit_loads: MemMap::new(),
            crit_stores: MemMap::new(),
            crit_hit: false,
            preempted: false,
        }
    }

    pub fn heap(&self) -> &CowHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut CowHeap {
        &mut self.heap
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Pointer to the object every part of the program state hangs from.
    pub fn root(&self) -> Pointer {
        self.root
    }

    pub fn set_root(&mut self, root: Pointer) {
        self.root = root;
    }

    /// Symbolic path condition of the current run, if any.
    pub fn assume(&self) -> Option<Pointer> {
        self.assume
    }

    pub fn set_assume(&mut self, assume: Option<Pointer>) {
        self.assume = assume;
    }

    pub fn set_booting(&mut self, booting: bool) {
        self.booting = booting;
    }

    // === Choices ===

    /// Pick one of `count` options. Replays the lock queue first, then the
    /// recorded stack, and opens a new choice point past its end. A single
    /// option is not a choice point and is never recorded.
    pub fn choose(&mut self, count: u32) -> VmResult<u32> {
        if self.booting {
            return Err(VmError::ChoiceDuringBoot);
        }
        if count <= 1 {
            return Ok(0);
        }
        if let Some(c) = self.lock.pop_front() {
            self.stack.push(c);
            self.level += 1;
            return Ok(c.taken);
        }
        if let Some(c) = self.stack.get(self.level) {
            self.level += 1;
            return Ok(c.taken);
        }
        self.stack.push(Choice::new(0, count));
        self.level += 1;
        Ok(0)
    }

    /// Advance to the next unexplored combination of choices. Returns true
    /// once every combination has been run.
    pub fn finished(&mut self) -> bool {
        self.level = 0;
        while self.stack.last().is_some_and(|c| c.taken + 1 >= c.total) {
            self.stack.pop();
        }
        match self.stack.last_mut() {
            Some(c) => {
                c.taken += 1;
                false
            }
            None => true,
        }
    }

    pub fn stack(&self) -> &[Choice] {
        &self.stack
    }

    /// Number of choices consumed by the current run.
    pub fn level(&self) -> usize {
        self.level
    }

    /// The choices consumed by the current run, in order.
    pub fn consumed(&self) -> &[Choice] {
        &self.stack[..self.level.min(self.stack.len())]
    }

    /// Force the next run to replay `lock`.
    pub fn set_lock(&mut self, lock: impl IntoIterator<Item = Choice>) {
        self.lock = lock.into_iter().collect();
    }

    /// Drop all choice state.
    pub fn reset_choices(&mut self) {
        self.stack.clear();
        self.lock.clear();
        self.level = 0;
    }

    // === Runs ===

    /// Make `snap` the current state and reset everything a run records.
    pub fn load(&mut self, snap: &Snapshot) {
        self.heap.restore(snap);
        self.assume = None;
        self.trace.clear();
        self.interrupts.clear();
        self.accepting = false;
        self.error = false;
        self.cancel = false;
        self.instructions = 0;
        self.tid = None;
        self.pc = 0;
        self.crit_hit = false;
        self.preempted = false;
    }

    pub fn snapshot(&mut self) -> TableResult<Snapshot> {
        self.heap.snapshot()
    }

    pub fn count_instruction(&mut self) {
        self.instructions += 1;
    }

    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }

    /// The thread the current run executes.
    pub fn tid(&self) -> Option<u32> {
        self.tid
    }

    pub fn set_tid(&mut self, tid: u32) {
        self.tid = Some(tid);
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Position of the instruction being executed, for interrupt records.
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    // === Trace and flags ===

    pub fn trace(&mut self, text: impl Into<String>) {
        let text = text.into();
        trace!(tid = ?self.tid, %text, "trace");
        self.trace.push(text);
    }

    pub fn trace_lines(&self) -> &[String] {
        &self.trace
    }

    pub fn interrupts(&self) -> &[Interrupt] {
        &self.interrupts
    }

    /// Record a control-flow interrupt at the current position.
    pub fn cfl_interrupt(&mut self) {
        self.interrupt(InterruptKind::Cfl);
    }

    fn interrupt(&mut self, kind: InterruptKind) {
        self.interrupts.push(Interrupt {
            kind,
            tid: self.tid.unwrap_or(0),
            pc: self.pc,
        });
    }

    pub fn set_accepting(&mut self) {
        self.accepting = true;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Abandon the current run; it produces no successor.
    pub fn cancel(&mut self) {
        self.cancel = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
    }

    /// Record a fault of the verified program. Returns whether the run
    /// should stop.
    pub fn fault(&mut self, fault: Fault) -> bool {
        warn!(tid = ?self.tid, pc = self.pc, %fault, "fault");
        self.trace.push(format!("FAULT: {fault}"));
        self.error = true;
        self.config.fault_policy == FaultPolicy::EndRun
    }

    // === Memory tracking ===

    pub fn set_tracking(&mut self, tracking: bool) {
        self.tracking = tracking;
    }

    /// Forget all recorded footprints.
    pub fn clear_critical(&mut self) {
        self.critical.clear();
    }

    /// Per-thread footprints recorded while tracking was on.
    pub fn critical(&self) -> &BTreeMap<u32, Footprint> {
        &self.critical
    }

    /// Ranges whose access preempts the current run: loads from `loads`,
    /// stores to `stores`. The first such access of a run still happens.
    pub fn set_critical(&mut self, loads: MemMap, stores: MemMap) {
        self.crit_loads = loads;
        self.crit_stores = stores;
    }

    pub fn clear_crit(&mut self) {
        self.crit_loads.clear();
        self.crit_stores.clear();
    }

    pub fn was_preempted(&self) -> bool {
        self.preempted
    }

    /// Account an access to `len` bytes at `p`. Returns false if the access
    /// must not happen.
    fn track(&mut self, p: Pointer, len: u32, load: bool, store: bool) -> bool {
        let Some(obj) = p.object() else {
            return true;
        };
        if !self.heap.is_shared(p) {
            return true;
        }
        let (start, end) = (p.offset, p.offset.saturating_add(len));

        let hit = (load && self.crit_loads.intersect(obj, start, end))
            || (store && self.crit_stores.intersect(obj, start, end));
        if hit {
            if self.crit_hit {
                self.preempted = true;
                self.interrupt(InterruptKind::Mem);
                trace!(tid = ?self.tid, pc = self.pc, %p, "preempted");
                return false;
            }
            self.crit_hit = true;
        }

        if self.tracking {
            if let Some(tid) = self.tid {
                let fp = self.critical.entry(tid).or_default();
                if load {
                    fp.loads.insert(obj, start, end);
                }
                if store {
                    fp.stores.insert(obj, start, end);
                }
            }
        }
        true
    }

    /// Tracked load.
    pub fn read(&mut self, p: Pointer, width: u8) -> Result<Access<Value>, Fault> {
        let value = self.heap.read(p, width)?;
        if !self.track(p, u32::from(width), true, false) {
            return Ok(Access::Preempted);
        }
        Ok(Access::Done(value))
    }

    /// Tracked store.
    pub fn write(&mut self, p: Pointer, value: Value) -> Result<Access<()>, Fault> {
        self.heap.check_write(p, u32::from(value.width()))?;
        if !self.track(p, u32::from(value.width()), false, true) {
            return Ok(Access::Preempted);
        }
        self.heap.write(p, value)?;
        Ok(Access::Done(()))
    }

    /// Tracked read-modify-write, performed as a single access.
    pub fn update(
        &mut self,
        p: Pointer,
        width: u8,
        f: impl FnOnce(Value) -> Value,
    ) -> Result<Access<Value>, Fault> {
        let old = self.heap.read(p, width)?;
        self.heap.check_write(p, u32::from(width))?;
        if !self.track(p, u32::from(width), true, true) {
            return Ok(Access::Preempted);
        }
        self.heap.write(p, f(old))?;
        Ok(Access::Done(old))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_heap::PointerKind;
    use strata_table::TableConfig;

    fn ctx() -> Context {
        Context::new(CowHeap::new(TableConfig::default()), ContextConfig::default())
    }

    /// Run every combination of a 2-way then a 3-way choice.
    #[test]
    fn test_choice_enumeration() {
        let mut ctx = ctx();
        let mut seen = vec![];
        loop {
            let a = ctx.choose(2).unwrap();
            let b = ctx.choose(3).unwrap();
            seen.push((a, b));
            if ctx.finished() {
                break;
            }
        }
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_single_option_is_not_recorded() {
        let mut ctx = ctx();
        assert_eq!(ctx.choose(1).unwrap(), 0);
        assert_eq!(ctx.choose(0).unwrap(), 0);
        assert!(ctx.stack().is_empty());
        assert!(ctx.finished());
    }

    #[test]
    fn test_lock_replay() {
        let mut ctx = ctx();
        ctx.set_lock([Choice::new(1, 2), Choice::new(2, 3)]);
        assert_eq!(ctx.choose(2).unwrap(), 1);
        assert_eq!(ctx.choose(3).unwrap(), 2);
        assert_eq!(ctx.consumed(), &[Choice::new(1, 2), Choice::new(2, 3)]);
        // the lock is exhausted: the next choice point is fresh
        assert_eq!(ctx.choose(4).unwrap(), 0);
        assert_eq!(ctx.level(), 3);
    }

    #[test]
    fn test_no_choice_while_booting() {
        let mut ctx = ctx();
        ctx.set_booting(true);
        assert!(matches!(ctx.choose(2), Err(VmError::ChoiceDuringBoot)));
    }

    #[test]
    fn test_fault_policy() {
        let mut ctx = ctx();
        assert!(ctx.fault(Fault::Assert { pc: 3 }));
        assert!(ctx.is_error());
        assert_eq!(ctx.trace_lines(), &["FAULT: assertion failed at pc 3".to_string()]);

        let mut lenient = Context::new(
            CowHeap::new(TableConfig::default()),
            ContextConfig {
                fault_policy: FaultPolicy::Continue,
            },
        );
        assert!(!lenient.fault(Fault::Assert { pc: 0 }));
    }

    #[test]
    fn test_only_shared_memory_is_tracked() {
        let mut ctx = ctx();
        let private = ctx.heap_mut().make(8, PointerKind::Heap, 0).unwrap();
        let shared = ctx.heap_mut().make(8, PointerKind::Global, 1).unwrap();
        ctx.heap_mut().share(shared).unwrap();
        ctx.set_tracking(true);
        ctx.set_tid(0);

        ctx.write(private, Value::i32(1)).unwrap();
        ctx.write(shared.with_offset(4), Value::i32(1)).unwrap();
        ctx.read(shared, 4).unwrap();

        let fp = &ctx.critical()[&0];
        let obj = shared.object().unwrap();
        assert_eq!(fp.stores.iter().collect::<Vec<_>>(), vec![(obj, 4, 8)]);
        assert_eq!(fp.loads.iter().collect::<Vec<_>>(), vec![(obj, 0, 4)]);
    }

    #[test]
    fn test_second_critical_access_preempts() {
        let mut ctx = ctx();
        let g = ctx.heap_mut().make(8, PointerKind::Global, 0).unwrap();
        ctx.heap_mut().share(g).unwrap();
        ctx.heap_mut().write(g, Value::i32(5)).unwrap();
        let snap = ctx.snapshot().unwrap();
        ctx.load(&snap);
        ctx.set_tid(1);
        ctx.set_pc(7);

        let obj = g.object().unwrap();
        let mut crit = MemMap::new();
        crit.insert(obj, 0, 4);
        ctx.set_critical(crit.clone(), crit);

        assert_eq!(ctx.read(g, 4).unwrap(), Access::Done(Value::i32(5)));
        // unrelated bytes of the same object do not count
        assert!(matches!(ctx.read(g.with_offset(4), 4).unwrap(), Access::Done(_)));
        assert_eq!(ctx.write(g, Value::i32(6)).unwrap(), Access::Preempted);
        assert!(ctx.was_preempted());
        assert_eq!(ctx.heap().read(g, 4).unwrap().as_i32(), Some(5));
        assert_eq!(
            ctx.interrupts(),
            &[Interrupt {
                kind: InterruptKind::Mem,
                tid: 1,
                pc: 7
            }]
        );
    }

    #[test]
    fn test_faulting_access() {
        let mut ctx = ctx();
        let g = ctx.heap_mut().make(4, PointerKind::Global, 0).unwrap();
        assert!(matches!(
            ctx.write(g.with_offset(2), Value::i32(0)),
            Err(Fault::Memory(strata_heap::MemFault::OutOfBounds { .. }))
        ));
    }
}
