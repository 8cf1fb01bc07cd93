//! Interpreter boundary for the model checker.
//!
//! [`Context`] is everything an interpreter run can touch: the heap, the
//! choice machinery that enumerates nondeterminism, fault and trace
//! reporting, and memory-access tracking used to detect interference
//! between threads. A [`Program`] drives a context; the [`machine`] module
//! provides a small multi-threaded register machine implementing it.

pub mod context;
pub mod machine;
pub mod memmap;
pub mod models;

pub use context::{Access, Context, ContextConfig, FaultPolicy};
pub use memmap::{Footprint, MemMap};

use strata_heap::{MemFault, Pointer};
use strata_table::TableError;
use thiserror::Error;

/// A nondeterministic decision: option `taken` out of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Choice {
    pub taken: u32,
    pub total: u32,
}

impl Choice {
    pub fn new(taken: u32, total: u32) -> Self {
        Self { taken, total }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterruptKind {
    /// Preempted at a memory access.
    Mem,
    /// Interrupted at a control-flow point (e.g. a loop back edge).
    Cfl,
}

/// Where a run was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interrupt {
    pub kind: InterruptKind,
    pub tid: u32,
    pub pc: u32,
}

/// Control-flow faults raised by the interpreter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlFault {
    #[error("jump to illegal target {target}")]
    IllegalTarget { target: u32 },

    #[error("jump from function {from} into function {to}")]
    CrossFunction { from: u32, to: u32 },

    #[error("control fell past the end of function {function}")]
    PastEnd { function: u32 },
}

/// A fault of the verified program. Recorded in the run's label.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("memory fault: {0}")]
    Memory(#[from] MemFault),

    #[error("control fault: {0}")]
    Control(#[from] ControlFault),

    #[error("assertion failed at pc {pc}")]
    Assert { pc: u32 },
}

/// A broken interpreter invariant. Exploration cannot continue.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("choice encountered while booting")]
    ChoiceDuringBoot,

    #[error("malformed program: {0}")]
    Malformed(String),

    #[error("fault while booting: {0}")]
    BootFault(Fault),

    #[error("missing state root {0}")]
    NoRoot(Pointer),

    #[error(transparent)]
    Table(#[from] TableError),
}

pub type VmResult<T> = Result<T, VmError>;

/// An interpreted program.
///
/// `boot` builds the initial state in a fresh context and must not make
/// choices. `run` executes from the state loaded in the context until the
/// run blocks: it picks a thread with [`Context::choose`], executes it until
/// the thread yields, finishes, faults or is preempted, and leaves the
/// resulting state in the context's heap.
pub trait Program: Send + Sync {
    fn name(&self) -> &str;

    fn boot(&self, ctx: &mut Context) -> VmResult<()>;

    fn run(&self, ctx: &mut Context) -> VmResult<()>;
}

impl<P: Program + ?Sized> Program for std::sync::Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn boot(&self, ctx: &mut Context) -> VmResult<()> {
        (**self).boot(ctx)
    }

    fn run(&self, ctx: &mut Context) -> VmResult<()> {
        (**self).run(ctx)
    }
}
