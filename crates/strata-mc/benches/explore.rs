//! Criterion benchmarks for state-space exploration.
//!
//! Run with: cargo bench -p strata-mc

use criterion::{criterion_group, criterion_main, Criterion};
use strata_mc::{Builder, BuilderConfig, Search, SearchConfig};
use strata_vm::machine::{Machine, Op};
use strata_vm::models;

/// `threads` workers, each incrementing a shared counter `rounds` times.
fn contended(threads: u32, rounds: u32) -> Machine {
    let mut code = Vec::new();
    for _ in 0..rounds {
        code.extend([Op::Load(0), Op::Add(1), Op::Store(0), Op::Yield]);
    }
    code.push(Op::Exit);
    (0..threads).fold(Machine::new("contended", 1), |m, _| m.thread(code.clone()))
}

fn bench_search(c: &mut Criterion, name: &str, model: Machine, parallel: bool) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let builder = Builder::new(model.clone(), BuilderConfig::default()).unwrap();
            let mut search = Search::new(
                builder,
                SearchConfig {
                    parallel,
                    stop_on_error: false,
                    ..Default::default()
                },
            );
            search.run().unwrap();
        })
    });
}

fn bench_edges(c: &mut Criterion) {
    let mut builder = Builder::new(contended(3, 1), BuilderConfig::default()).unwrap();
    let init = builder.initial();
    c.bench_function("edges_initial_3_threads", |b| {
        b.iter(|| {
            let mut n = 0;
            builder.edges(&init, |_, _, _| n += 1).unwrap();
            n
        })
    });
}

fn benchmarks(c: &mut Criterion) {
    bench_search(c, "lost_update_seq", models::lost_update(), false);
    bench_search(c, "contended_3x2_seq", contended(3, 2), false);
    bench_search(c, "contended_3x2_par", contended(3, 2), true);
    bench_edges(c);
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
