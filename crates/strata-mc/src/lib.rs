//! State-space construction for explicit-state model checking.
//!
//! [`Builder`] turns an interpreted [`Program`](strata_vm::Program) into a
//! state graph: [`Builder::initials`] yields the booted state and
//! [`Builder::edges`] yields every successor of a state together with the
//! [`Label`] of the transition. Successors are deduplicated in a concurrent
//! snapshot table shared by all clones of a builder, so a [`search`] can
//! run one clone per worker thread.

pub mod builder;
pub mod hasher;
pub mod label;
pub mod search;
pub mod solver;

pub use builder::{Builder, BuilderConfig, BuilderStats, State};
pub use hasher::SnapHasher;
pub use label::Label;
pub use search::{ProgressCounters, Search, SearchConfig, SearchOutcome, StateInfo};
pub use solver::{NoSolver, Solver};

use strata_table::TableError;
use strata_vm::{Choice, VmError};
use thiserror::Error;

/// A failure that stops the whole exploration.
///
/// Faults of the verified program are not errors here; they are reported
/// through [`Label::error`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("interpreter error: {0}")]
    Vm(#[from] VmError),

    #[error("snapshot table: {0}")]
    Table(#[from] TableError),

    #[error("state has no valid root object")]
    InvalidState,

    #[error("boot faulted: {trace}")]
    BootFailed { trace: String },

    #[error("replay diverged: ran {ran:?} under lock {lock:?}")]
    LockMismatch { lock: Vec<Choice>, ran: Vec<Choice> },
}

pub type BuildResult<T> = Result<T, BuildError>;
