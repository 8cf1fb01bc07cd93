//! Concurrent deduplication table for model checking.
//!
//! Stores one canonical value per equivalence class defined by a
//! caller-supplied [`TableHasher`]. Many threads may insert at once; the
//! table grows by appending rows of doubling size, and threads that notice
//! a growth in progress help migrate entries instead of blocking.

mod cell;
pub mod set;

pub use set::{ConcurrentSet, TableConfig, TableError, TableResult};

/// Hash and equality policy for values stored in a [`ConcurrentSet`].
///
/// Two values that are `equal` must produce the same `hash`.
pub trait TableHasher<T> {
    fn hash(&self, value: &T) -> u64;
    fn equal(&self, a: &T, b: &T) -> bool;
}

impl<T, H: TableHasher<T> + ?Sized> TableHasher<T> for &H {
    #[inline]
    fn hash(&self, value: &T) -> u64 {
        (**self).hash(value)
    }

    #[inline]
    fn equal(&self, a: &T, b: &T) -> bool {
        (**self).equal(a, b)
    }
}
