//! Graph-structured heap for explicit-state model checking.
//!
//! A heap stores the memory of a verified program as objects linked by
//! tagged [`Pointer`]s. Every byte carries a definedness mask and every
//! aligned word records whether a pointer starts there, which is what lets
//! [`graph`] compare, hash and clone whole object graphs independently of
//! the physical identifiers objects happen to have.
//!
//! Two implementations share the [`Heap`] interface: [`MutableHeap`], a
//! plain object map, and [`CowHeap`], which layers writes over an immutable
//! [`Snapshot`] and interns committed object states across all heaps cloned
//! from the same pool.

pub mod cow;
pub mod graph;
pub mod heap;
pub mod object;
pub mod pointer;

pub use cow::{CowHeap, Snapshot};
pub use graph::{clone, compare, compare_with, hash, CloneMode};
pub use heap::{Heap, HeapRead, MutableHeap, PointerSlots};
pub use object::{Object, Value};
pub use pointer::{squash, Pointer, PointerKind, Target, POINTER_BYTES};

use thiserror::Error;

/// Largest object `make` and `resize` accept.
pub const MAX_OBJECT_SIZE: u32 = 16 << 20;

/// A memory fault raised by a heap operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemFault {
    #[error("allocation of {size} bytes exceeds the object size limit")]
    OversizedAlloc { size: u64 },

    #[error("invalid pointer {pointer}")]
    InvalidPointer { pointer: Pointer },

    #[error("access of {width} bytes through {pointer} is out of bounds (object size {size})")]
    OutOfBounds {
        pointer: Pointer,
        width: u32,
        size: u32,
    },

    #[error("double free of {pointer}")]
    DoubleFree { pointer: Pointer },

    #[error("write through read-only pointer {pointer}")]
    Unwritable { pointer: Pointer },

    #[error("pointer {pointer} cannot be dereferenced")]
    NotDereferenceable { pointer: Pointer },

    #[error("access width of {width} bytes through {pointer} is not 1, 2, 4 or 8")]
    BadWidth { pointer: Pointer, width: u8 },
}

pub type HeapResult<T> = Result<T, MemFault>;
