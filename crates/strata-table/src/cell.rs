//! A single slot of a table row.
//!
//! The slot state lives in one atomic word: the low three bits are flags
//! and the remaining bits hold the high bits of the stored value's hash,
//! which lets probes reject most mismatches without touching the value.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

const EMPTY: u64 = 0;
/// A store is in progress; the value is not yet readable.
const BUSY: u64 = 1;
/// The row is being migrated; the slot must not be used any more.
const INVALID: u64 = 2;
/// The value is initialised.
const FULL: u64 = 4;
const TAG_MASK: u64 = !7;

/// Outcome of probing a slot for a given value.
pub(crate) enum Probe {
    Empty,
    Invalid,
    Match,
    Other,
}

pub(crate) struct Cell<T> {
    state: AtomicU64,
    hash: UnsafeCell<u64>,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the value is written exactly once, before FULL is published with
// release ordering, and is never mutated afterwards. Readers only touch it
// after observing FULL with acquire ordering.
unsafe impl<T: Send> Send for Cell<T> {}
unsafe impl<T: Send + Sync> Sync for Cell<T> {}

impl<T> Cell<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(EMPTY),
            hash: UnsafeCell::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    fn tag(hash: u64) -> u64 {
        (hash & TAG_MASK) | FULL
    }

    /// Spin until no store is in flight and return the settled state.
    #[inline]
    fn settled(&self) -> u64 {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & BUSY == 0 {
                return s;
            }
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.state.load(Ordering::Acquire) == EMPTY
    }

    /// Claim an empty slot. Hands the value back if the slot was taken.
    pub(crate) fn try_store(&self, value: T, hash: u64) -> Result<(), T> {
        match self
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: BUSY gives us exclusive access until FULL is published.
                unsafe {
                    (*self.value.get()).write(value);
                    *self.hash.get() = hash;
                }
                self.state.store(Self::tag(hash), Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    /// Compare the slot against a hash, waiting out a concurrent store.
    #[inline]
    pub(crate) fn probe(&self, hash: u64) -> Probe {
        let s = self.settled();
        if s == EMPTY {
            Probe::Empty
        } else if s & INVALID != 0 {
            Probe::Invalid
        } else if s & TAG_MASK == hash & TAG_MASK {
            Probe::Match
        } else {
            Probe::Other
        }
    }

    /// The stored value. Only call after a probe reported a full slot.
    #[inline]
    pub(crate) fn value(&self) -> &T {
        debug_assert!(self.state.load(Ordering::Acquire) & FULL != 0);
        // SAFETY: FULL was observed with acquire ordering by the caller.
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// Mark the slot invalid and return its content, if any. Returns `None`
    /// for empty slots and for slots some other thread invalidated first.
    pub(crate) fn invalidate(&self) -> Option<(&T, u64)> {
        let mut s = self.state.load(Ordering::Acquire);
        loop {
            if s & BUSY != 0 {
                std::hint::spin_loop();
                s = self.state.load(Ordering::Acquire);
                continue;
            }
            if s & INVALID != 0 {
                return None;
            }
            match self
                .state
                .compare_exchange_weak(s, s | INVALID, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => s = actual,
            }
        }
        if s & FULL == 0 {
            return None;
        }
        // SAFETY: FULL observed; hash and value are immutable from here on.
        Some((self.value(), unsafe { *self.hash.get() }))
    }

    /// Content of a live slot, for single-threaded iteration.
    pub(crate) fn live(&self) -> Option<&T> {
        let s = self.settled();
        if s & FULL != 0 && s & INVALID == 0 {
            Some(self.value())
        } else {
            None
        }
    }
}

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() & FULL != 0 {
            // SAFETY: FULL means the value was initialised and not yet dropped.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}
