//! Interference handling on random two-thread programs.

use std::collections::BTreeSet;

use proptest::prelude::*;
use strata_mc::{Builder, BuilderConfig, Search, SearchConfig, SearchOutcome};
use strata_vm::machine::{Machine, Op};
use strata_vm::{Choice, InterruptKind};

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u32..2).prop_map(Op::Load),
        3 => (0u32..2).prop_map(Op::Store),
        2 => (0u32..2).prop_map(|s| Op::AtomicAdd(s, 1)),
        2 => Just(Op::Add(1)),
        1 => Just(Op::Yield),
    ]
}

fn code() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op(), 1..6).prop_map(|mut ops| {
        ops.push(Op::Exit);
        ops
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every edge out of the initial state belongs to exactly one thread,
    /// its choices are the scheduling decision for that thread alone, and
    /// a run is preempted at most once.
    #[test]
    fn edges_are_consistent(t0 in code(), t1 in code()) {
        let model = Machine::new("random", 2).thread(t0).thread(t1);
        let mut b = Builder::new(model, BuilderConfig::default()).unwrap();
        let init = b.initial();
        let mut labels = Vec::new();
        b.edges(&init, |_, l, _| labels.push(l)).unwrap();

        prop_assert_eq!(labels.len(), 2);
        let stacks: BTreeSet<_> = labels.iter().map(|l| l.stack.clone()).collect();
        prop_assert_eq!(
            stacks,
            BTreeSet::from([vec![Choice::new(0, 2)], vec![Choice::new(1, 2)]])
        );
        for (tid, label) in labels.iter().enumerate() {
            let mem: Vec<_> = label
                .interrupts
                .iter()
                .filter(|i| i.kind == InterruptKind::Mem)
                .collect();
            prop_assert!(mem.len() <= 1);
            for i in mem {
                prop_assert_eq!(i.tid, tid as u32);
            }
        }
    }

    /// Sequential and parallel search agree on the size of the state space.
    #[test]
    fn search_terminates_and_agrees(t0 in code(), t1 in code()) {
        let run = |parallel| {
            let model = Machine::new("random", 2).thread(t0.clone()).thread(t1.clone());
            let b = Builder::new(model, BuilderConfig::default()).unwrap();
            let mut s = Search::new(b, SearchConfig { parallel, stop_on_error: false, ..Default::default() });
            match s.run().unwrap() {
                SearchOutcome::Ok { states, edges, .. } => (states, edges),
                other => panic!("{other:?}"),
            }
        };
        prop_assert_eq!(run(false), run(true));
    }
}
