//! Multi-threaded behaviour of the concurrent set: deduplication across
//! threads, and content retention while the table grows under contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use strata_table::{ConcurrentSet, TableConfig, TableHasher};

struct Mix;

impl TableHasher<u64> for Mix {
    fn hash(&self, v: &u64) -> u64 {
        let mut x = *v ^ 0x51_7cc1_b727_220a_95;
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
        x ^ (x >> 31)
    }
    fn equal(&self, a: &u64, b: &u64) -> bool {
        a == b
    }
}

/// Equality on the value's residue: many distinct values share a class.
struct Modulo(u64);

impl TableHasher<u64> for Modulo {
    fn hash(&self, v: &u64) -> u64 {
        Mix.hash(&(v % self.0))
    }
    fn equal(&self, a: &u64, b: &u64) -> bool {
        a % self.0 == b % self.0
    }
}

fn tiny() -> TableConfig {
    TableConfig {
        initial_size: 8,
        ..Default::default()
    }
}

#[test]
fn test_one_winner_per_value() {
    let set = ConcurrentSet::new(tiny());
    let winners = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));
    let mut handles = vec![];

    for _ in 0..8 {
        let mut set = set.clone();
        let winners = Arc::clone(&winners);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..2000u64 {
                let (_, new) = set.insert(i, &Mix).unwrap();
                if new {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::Relaxed), 2000);
    assert_eq!(set.len(), 2000);
}

#[test]
fn test_canonical_value_is_first_stored() {
    let hasher = Modulo(10);
    let mut set = ConcurrentSet::new(tiny());
    for i in 0..10u64 {
        set.insert(i, &hasher).unwrap();
    }
    let mut handles = vec![];
    for t in 1..5u64 {
        let mut set = set.clone();
        handles.push(thread::spawn(move || {
            let hasher = Modulo(10);
            for i in 0..10u64 {
                let (canonical, new) = set.insert(t * 10 + i, &hasher).unwrap();
                assert!(!new);
                assert_eq!(canonical, i);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(set.len(), 10);
}

#[test]
fn test_disjoint_inserts_during_growth() {
    let set = ConcurrentSet::new(tiny());
    let mut handles = vec![];

    for t in 0..6u64 {
        let mut set = set.clone();
        handles.push(thread::spawn(move || {
            for i in 0..3000u64 {
                assert!(set.insert(t * 100_000 + i, &Mix).unwrap().1);
            }
            // everything this thread stored is still visible to it
            for i in 0..3000u64 {
                assert_eq!(set.find(&(t * 100_000 + i), &Mix), Some(t * 100_000 + i));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut set = set;
    assert_eq!(set.len(), 18_000);
    assert!(set.grows() >= 10);
    let mut values = set.values();
    values.sort_unstable();
    values.dedup();
    assert_eq!(values.len(), 18_000);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn growth_retains_every_key(keys in prop::collection::vec(any::<u64>(), 0..600)) {
        let mut set = ConcurrentSet::new(TableConfig { initial_size: 2, ..Default::default() });
        let mut expected = std::collections::HashSet::new();
        for &k in &keys {
            let (stored, new) = set.insert(k, &Mix).unwrap();
            prop_assert_eq!(stored, k);
            prop_assert_eq!(new, expected.insert(k));
        }
        prop_assert_eq!(set.len(), expected.len());
        for k in &expected {
            prop_assert_eq!(set.find(k, &Mix), Some(*k));
        }
    }
}
