//! Property tests for snapshots and graph operations.

use std::cmp::Ordering;

use proptest::prelude::*;
use strata_heap::{
    clone, compare, hash, CloneMode, CowHeap, Heap, HeapRead, MutableHeap, Pointer, PointerKind,
    Value,
};
use strata_table::TableConfig;

const SLOTS: u32 = 8;
const OBJECT_SIZE: u32 = SLOTS * 8;

/// One step of a random heap mutation over a fixed set of objects.
#[derive(Debug, Clone)]
enum Op {
    /// Write an integer of `width` bytes with a definedness mask.
    Int {
        obj: usize,
        slot: u32,
        bits: u64,
        defined: u64,
        width: u8,
    },
    /// Store a pointer to object `to` in a slot of `obj`.
    Link { obj: usize, slot: u32, to: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (
            0usize..4,
            0..SLOTS,
            any::<u64>(),
            any::<u64>(),
            prop::sample::select(vec![1u8, 2, 4, 8])
        )
            .prop_map(|(obj, slot, bits, defined, width)| Op::Int {
                obj,
                slot,
                bits,
                defined,
                width
            }),
        (0usize..4, 0..SLOTS, 0usize..4).prop_map(|(obj, slot, to)| Op::Link { obj, slot, to }),
    ]
}

fn apply<H: Heap>(heap: &mut H, objs: &[Pointer], op: &Op) {
    match *op {
        Op::Int {
            obj,
            slot,
            bits,
            defined,
            width,
        } => {
            // the rest of the slot becomes undefined, so stale pointer bytes
            // never survive as data
            let at = objs[obj].with_offset(slot * 8);
            heap.write(at, Value::undef(8)).unwrap();
            heap.write(at, Value::partial(bits, defined, width)).unwrap();
        }
        Op::Link { obj, slot, to } => heap
            .write(objs[obj].with_offset(slot * 8), Value::ptr(objs[to]))
            .unwrap(),
    }
}

fn build<H: Heap>(heap: &mut H, hint: u32, ops: &[Op]) -> Vec<Pointer> {
    let objs: Vec<Pointer> = (0..4)
        .map(|i| heap.make(OBJECT_SIZE, PointerKind::Heap, hint + i).unwrap())
        .collect();
    // keep every object reachable from the root
    for i in 1..4 {
        heap.write(objs[0].with_offset((SLOTS - 1) * 8 - (i as u32 - 1) * 8), Value::ptr(objs[i]))
            .unwrap();
    }
    for op in ops {
        apply(heap, &objs, op);
    }
    objs
}

fn dump<H: HeapRead>(heap: &H, objs: &[Pointer]) -> Vec<Value> {
    objs.iter()
        .flat_map(|&p| (0..OBJECT_SIZE).map(move |i| (p, i)))
        .map(|(p, i)| heap.read(p.with_offset(i), 1).unwrap())
        .collect()
}

fn cow() -> CowHeap {
    CowHeap::new(TableConfig {
        initial_size: 64,
        ..Default::default()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn restore_brings_back_every_byte(
        first in prop::collection::vec(op(), 0..24),
        second in prop::collection::vec(op(), 1..24),
    ) {
        let mut heap = cow();
        let objs = build(&mut heap, 0, &first);
        let expected = dump(&heap, &objs);
        let pointers: Vec<_> = objs
            .iter()
            .map(|&p| heap.pointers(p, OBJECT_SIZE).unwrap().collect::<Vec<_>>())
            .collect();

        let snap = heap.snapshot().unwrap();
        for op in &second {
            apply(&mut heap, &objs, op);
        }
        heap.free(objs[3]).unwrap();
        heap.restore(&snap);

        prop_assert_eq!(dump(&heap, &objs), expected);
        for (p, slots) in objs.iter().zip(&pointers) {
            prop_assert_eq!(&heap.pointers(*p, OBJECT_SIZE).unwrap().collect::<Vec<_>>(), slots);
        }
    }

    #[test]
    fn equal_histories_hash_equal(ops in prop::collection::vec(op(), 0..32)) {
        let mut h1 = MutableHeap::new();
        let mut h2 = cow();
        let a = build(&mut h1, 10, &ops);
        let b = build(&mut h2, 500, &ops);
        let snap = h2.snapshot().unwrap();

        prop_assert_eq!(compare(&h1, &h2, a[0], b[0]), Ordering::Equal);
        prop_assert_eq!(compare(&h1, &snap, a[0], b[0]), Ordering::Equal);
        prop_assert_eq!(hash(&h1, a[0]), hash(&snap, b[0]));
    }

    #[test]
    fn compare_agrees_with_hash(
        ops1 in prop::collection::vec(op(), 0..16),
        ops2 in prop::collection::vec(op(), 0..16),
    ) {
        let mut h1 = MutableHeap::new();
        let mut h2 = MutableHeap::new();
        let a = build(&mut h1, 0, &ops1);
        let b = build(&mut h2, 0, &ops2);
        let ord = compare(&h1, &h2, a[0], b[0]);
        prop_assert_eq!(ord, compare(&h2, &h1, b[0], a[0]).reverse());
        if ord == Ordering::Equal {
            prop_assert_eq!(hash(&h1, a[0]), hash(&h2, b[0]));
        }
    }

    #[test]
    fn clone_is_equal_to_source(ops in prop::collection::vec(op(), 0..32)) {
        let mut h1 = MutableHeap::new();
        let a = build(&mut h1, 0, &ops);
        let mut h2 = cow();
        let root = clone(&h1, &mut h2, a[0], CloneMode::All).unwrap();
        prop_assert_eq!(compare(&h1, &h2, a[0], root), Ordering::Equal);
        prop_assert_eq!(hash(&h1, a[0]), hash(&h2, root));
    }
}
