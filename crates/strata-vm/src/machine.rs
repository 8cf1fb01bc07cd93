//! A small multi-threaded register machine.
//!
//! Every thread runs its own list of [`Op`]s with two registers: an integer
//! accumulator and a pointer register. Threads communicate only through
//! a shared array of 8-byte global slots. The whole machine state lives in
//! the heap, hanging from a root object:
//!
//! ```text
//! root:    [globals ptr: 8] [thread 0: pc 4 | acc 4 | ptr 8] [thread 1 ...]
//! globals: [slot 0: 8] [slot 1: 8] ...        (shared)
//! ```
//!
//! A run picks one runnable thread with [`Context::choose`] and executes it
//! until it yields, exits, jumps backwards, faults or is preempted.

use strata_heap::{Heap, HeapRead, Pointer, PointerKind, Value};
use tracing::debug;

use crate::context::{Access, Context};
use crate::{ControlFault, Fault, Program, VmError, VmResult};

/// Index of a global slot.
pub type Slot = u32;

const SLOT_BYTES: u32 = 8;
const THREAD_BYTES: u32 = 16;
const THREADS_AT: u32 = 8;

/// Program counter of a thread that has exited.
pub const EXITED: u32 = u32::MAX;

/// Machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    // === Shared memory ===
    /// acc = globals[slot]
    Load(Slot),
    /// globals[slot] = acc
    Store(Slot),
    /// globals[slot] += n as one access; acc = the new value.
    AtomicAdd(Slot, i32),
    /// globals[slot] = ptr, sharing everything ptr reaches.
    Publish(Slot),

    // === Registers ===
    Set(i32),
    Add(i32),
    /// acc = (acc == n)
    Eq(i32),
    /// acc = nondeterministic value in 0..n
    Choose(u32),

    // === Control flow ===
    Jump(u32),
    JumpIfZero(u32),
    /// ptr = address of instruction `pc` in the code of thread `function`.
    CodeAddr(u32, u32),
    /// Jump through ptr, which must point into this thread's code.
    JumpPtr,
    /// End the thread's time slice.
    Yield,
    Exit,

    // === Checks ===
    /// Fault unless acc != 0.
    Assert,
    /// Abandon the run unless acc != 0.
    Assume,
    Accept,
    Trace(String),

    // === Heap ===
    /// ptr = new object of the given size
    Malloc(u32),
    /// free(ptr)
    Free,
}

#[derive(Debug, Clone, Copy)]
struct Regs {
    pc: u32,
    acc: i32,
    ptr: Pointer,
}

impl Regs {
    /// An exited thread keeps no register contents.
    fn exited() -> Self {
        Self {
            pc: EXITED,
            acc: 0,
            ptr: Pointer::NULL,
        }
    }

    fn at(root: Pointer, tid: u32) -> Pointer {
        root.with_offset(THREADS_AT + tid * THREAD_BYTES)
    }

    fn load<H: HeapRead>(heap: &H, root: Pointer, tid: u32) -> VmResult<Self> {
        let base = Self::at(root, tid);
        let broken = |e| VmError::Malformed(format!("registers of thread {tid}: {e}"));
        let pc = heap.read(base, 4).map_err(broken)?;
        let acc = heap.read(base.with_offset(base.offset + 4), 4).map_err(broken)?;
        let ptr = heap
            .read_pointer(base.with_offset(base.offset + 8))
            .map_err(broken)?;
        Ok(Self {
            pc: pc.as_u64().unwrap_or(0) as u32,
            acc: acc.as_i32().unwrap_or(0),
            ptr: ptr.unwrap_or(Pointer::NULL),
        })
    }

    fn store<H: Heap>(&self, heap: &mut H, root: Pointer, tid: u32) -> VmResult<()> {
        let base = Self::at(root, tid);
        let broken = |e| VmError::Malformed(format!("registers of thread {tid}: {e}"));
        heap.write(base, Value::int(u64::from(self.pc), 4))
            .map_err(broken)?;
        heap.write(base.with_offset(base.offset + 4), Value::i32(self.acc))
            .map_err(broken)?;
        heap.write(base.with_offset(base.offset + 8), Value::ptr(self.ptr))
            .map_err(broken)?;
        Ok(())
    }
}

/// What to do after an instruction.
enum Step {
    Next,
    Goto(u32),
    /// Advance and end the run.
    Stop,
    /// End the run without advancing; the instruction did not happen.
    Halt,
    Fault(Fault),
}

/// A program for the register machine.
#[derive(Debug, Clone)]
pub struct Machine {
    name: String,
    slots: u32,
    init: Vec<(Slot, i32)>,
    threads: Vec<Vec<Op>>,
}

impl Machine {
    pub fn new(name: impl Into<String>, slots: u32) -> Self {
        Self {
            name: name.into(),
            slots,
            init: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// Initial value of a global slot (default zero).
    pub fn init(mut self, slot: Slot, value: i32) -> Self {
        self.init.push((slot, value));
        self
    }

    pub fn thread(mut self, code: Vec<Op>) -> Self {
        self.threads.push(code);
        self
    }

    pub fn thread_count(&self) -> u32 {
        self.threads.len() as u32
    }

    pub fn slot_count(&self) -> u32 {
        self.slots
    }

    fn validate(&self) -> VmResult<()> {
        if self.threads.is_empty() {
            return Err(VmError::Malformed(format!("{}: no threads", self.name)));
        }
        let bad_slot = |s: Slot| s >= self.slots;
        for (tid, code) in self.threads.iter().enumerate() {
            for op in code {
                let slot = match op {
                    Op::Load(s) | Op::Store(s) | Op::AtomicAdd(s, _) | Op::Publish(s) => *s,
                    _ => continue,
                };
                if bad_slot(slot) {
                    return Err(VmError::Malformed(format!(
                        "{}: thread {tid} uses slot {slot} of {}",
                        self.name, self.slots
                    )));
                }
            }
        }
        if let Some((slot, _)) = self.init.iter().find(|(s, _)| bad_slot(*s)) {
            return Err(VmError::Malformed(format!(
                "{}: initialiser for slot {slot} of {}",
                self.name, self.slots
            )));
        }
        Ok(())
    }

    fn globals<H: HeapRead>(heap: &H, root: Pointer) -> VmResult<Pointer> {
        heap.read_pointer(root)
            .ok()
            .flatten()
            .ok_or(VmError::NoRoot(root))
    }

    fn slot(globals: Pointer, slot: Slot) -> Pointer {
        globals.with_offset(slot * SLOT_BYTES)
    }

    fn jump(&self, tid: u32, target: u32) -> Step {
        if target as usize >= self.threads[tid as usize].len() {
            Step::Fault(ControlFault::IllegalTarget { target }.into())
        } else {
            Step::Goto(target)
        }
    }

    fn step(
        &self,
        ctx: &mut Context,
        globals: Pointer,
        tid: u32,
        regs: &mut Regs,
        op: &Op,
    ) -> VmResult<Step> {
        let step = match op {
            Op::Load(s) => match ctx.read(Self::slot(globals, *s), 4) {
                Ok(Access::Done(v)) => {
                    regs.acc = v.as_i32().unwrap_or(0);
                    Step::Next
                }
                Ok(Access::Preempted) => Step::Halt,
                Err(f) => Step::Fault(f),
            },
            Op::Store(s) => match ctx.write(Self::slot(globals, *s), Value::i32(regs.acc)) {
                Ok(Access::Done(())) => Step::Next,
                Ok(Access::Preempted) => Step::Halt,
                Err(f) => Step::Fault(f),
            },
            Op::AtomicAdd(s, n) => {
                let n = *n;
                let add = |v: Value| Value::i32(v.as_i32().unwrap_or(0).wrapping_add(n));
                match ctx.update(Self::slot(globals, *s), 4, add) {
                    Ok(Access::Done(old)) => {
                        regs.acc = old.as_i32().unwrap_or(0).wrapping_add(n);
                        Step::Next
                    }
                    Ok(Access::Preempted) => Step::Halt,
                    Err(f) => Step::Fault(f),
                }
            }
            Op::Publish(s) => match ctx.write(Self::slot(globals, *s), Value::ptr(regs.ptr)) {
                Ok(Access::Done(())) if ctx.heap().valid(regs.ptr) => {
                    match ctx.heap_mut().share(regs.ptr) {
                        Ok(()) => Step::Next,
                        Err(f) => Step::Fault(f.into()),
                    }
                }
                Ok(Access::Done(())) => Step::Next,
                Ok(Access::Preempted) => Step::Halt,
                Err(f) => Step::Fault(f),
            },
            Op::Set(n) => {
                regs.acc = *n;
                Step::Next
            }
            Op::Add(n) => {
                regs.acc = regs.acc.wrapping_add(*n);
                Step::Next
            }
            Op::Eq(n) => {
                regs.acc = i32::from(regs.acc == *n);
                Step::Next
            }
            Op::Choose(n) => {
                regs.acc = ctx.choose(*n)? as i32;
                Step::Next
            }
            Op::Jump(t) => self.jump(tid, *t),
            Op::JumpIfZero(t) if regs.acc == 0 => self.jump(tid, *t),
            Op::JumpIfZero(_) => Step::Next,
            Op::CodeAddr(function, pc) => {
                regs.ptr = Pointer::code(*function, *pc);
                Step::Next
            }
            Op::JumpPtr => match regs.ptr.code_location() {
                Some((function, _)) if function != tid => Step::Fault(
                    ControlFault::CrossFunction {
                        from: tid,
                        to: function,
                    }
                    .into(),
                ),
                Some((_, target)) => self.jump(tid, target),
                None => Step::Fault(
                    ControlFault::IllegalTarget {
                        target: regs.ptr.offset,
                    }
                    .into(),
                ),
            },
            Op::Yield => Step::Stop,
            Op::Exit => {
                *regs = Regs::exited();
                return Ok(Step::Halt);
            }
            Op::Assert if regs.acc == 0 => Step::Fault(Fault::Assert { pc: regs.pc }),
            Op::Assert => Step::Next,
            Op::Assume if regs.acc == 0 => {
                ctx.cancel();
                Step::Halt
            }
            Op::Assume => Step::Next,
            Op::Accept => {
                ctx.set_accepting();
                Step::Next
            }
            Op::Trace(text) => {
                ctx.trace(text.clone());
                Step::Next
            }
            Op::Malloc(size) => {
                let hint = (tid << 16) ^ regs.pc;
                match ctx.heap_mut().make(*size, PointerKind::Heap, hint) {
                    Ok(p) => {
                        regs.ptr = p;
                        Step::Next
                    }
                    Err(f) => Step::Fault(f.into()),
                }
            }
            Op::Free => match ctx.heap_mut().free(regs.ptr) {
                Ok(()) => Step::Next,
                Err(f) => Step::Fault(f.into()),
            },
        };
        Ok(step)
    }

    /// Value of a global slot in a machine state.
    pub fn global<H: HeapRead>(heap: &H, root: Pointer, slot: Slot) -> Option<i32> {
        let globals = Self::globals(heap, root).ok()?;
        heap.read(Self::slot(globals, slot), 4).ok()?.as_i32()
    }

    /// `(pc, acc)` of a thread in a machine state.
    pub fn thread_state<H: HeapRead>(heap: &H, root: Pointer, tid: u32) -> Option<(u32, i32)> {
        let regs = Regs::load(heap, root, tid).ok()?;
        Some((regs.pc, regs.acc))
    }
}

impl Program for Machine {
    fn name(&self) -> &str {
        &self.name
    }

    fn boot(&self, ctx: &mut Context) -> VmResult<()> {
        self.validate()?;
        let threads = self.thread_count();
        let heap = ctx.heap_mut();
        let boot = |e| VmError::BootFault(Fault::Memory(e));

        let root = heap
            .make(THREADS_AT + threads * THREAD_BYTES, PointerKind::Heap, 0)
            .map_err(boot)?;
        let globals = heap
            .make(self.slots.max(1) * SLOT_BYTES, PointerKind::Global, 1)
            .map_err(boot)?;
        for slot in 0..self.slots {
            heap.write(Self::slot(globals, slot), Value::int(0, 8))
                .map_err(boot)?;
        }
        for &(slot, value) in &self.init {
            heap.write(Self::slot(globals, slot), Value::i32(value))
                .map_err(boot)?;
        }
        heap.share(globals).map_err(boot)?;
        heap.write(root, Value::ptr(globals)).map_err(boot)?;

        let regs = Regs {
            pc: 0,
            acc: 0,
            ptr: Pointer::NULL,
        };
        for tid in 0..threads {
            regs.store(heap, root, tid)?;
        }
        ctx.set_root(root);
        debug!(program = %self.name, threads, slots = self.slots, "booted");
        Ok(())
    }

    fn run(&self, ctx: &mut Context) -> VmResult<()> {
        let root = ctx.root();
        let globals = Self::globals(ctx.heap(), root)?;

        let mut runnable = Vec::new();
        for tid in 0..self.thread_count() {
            if Regs::load(ctx.heap(), root, tid)?.pc != EXITED {
                runnable.push(tid);
            }
        }
        if runnable.is_empty() {
            ctx.cancel();
            return Ok(());
        }

        let pick = ctx.choose(runnable.len() as u32)?;
        let tid = runnable[pick as usize];
        ctx.set_tid(tid);
        let code = &self.threads[tid as usize];
        let mut regs = Regs::load(ctx.heap(), root, tid)?;

        loop {
            let Some(op) = code.get(regs.pc as usize) else {
                ctx.set_pc(regs.pc);
                ctx.fault(ControlFault::PastEnd { function: tid }.into());
                regs = Regs::exited();
                break;
            };
            ctx.set_pc(regs.pc);
            ctx.count_instruction();

            match self.step(ctx, globals, tid, &mut regs, op)? {
                Step::Next => regs.pc += 1,
                Step::Goto(target) if target <= regs.pc => {
                    regs.pc = target;
                    ctx.cfl_interrupt();
                    break;
                }
                Step::Goto(target) => regs.pc = target,
                Step::Stop => {
                    regs.pc += 1;
                    break;
                }
                Step::Halt => break,
                Step::Fault(fault) => {
                    regs.pc += 1;
                    if ctx.fault(fault) {
                        break;
                    }
                }
            }
        }

        regs.store(ctx.heap_mut(), root, tid)
    }
}
