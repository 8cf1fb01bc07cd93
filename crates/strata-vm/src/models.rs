//! Bundled demo programs for the register machine.

use crate::machine::{Machine, Op};

/// Names of all bundled models, in the order `strata list` prints them.
pub const NAMES: &[&str] = &[
    "counter",
    "atomic-counter",
    "lost-update",
    "double-free",
    "choice",
];

/// Look up a bundled model by name.
pub fn by_name(name: &str) -> Option<Machine> {
    let model = match name {
        "counter" => shared_counter(),
        "atomic-counter" => atomic_counter(),
        "lost-update" => lost_update(),
        "double-free" => double_free(),
        "choice" => choice(),
        _ => return None,
    };
    Some(model)
}

/// One-line description of a bundled model.
pub fn describe(name: &str) -> Option<&'static str> {
    let text = match name {
        "counter" => "two threads increment a shared counter with a load and a store",
        "atomic-counter" => "two threads increment a shared counter atomically",
        "lost-update" => "non-atomic increments plus a checker asserting the final count",
        "double-free" => "a thread frees the same allocation twice",
        "choice" => "a thread stores one of three nondeterministic values",
        _ => return None,
    };
    Some(text)
}

fn increment() -> Vec<Op> {
    vec![Op::Load(0), Op::Add(1), Op::Store(0), Op::Exit]
}

pub fn shared_counter() -> Machine {
    Machine::new("counter", 1)
        .thread(increment())
        .thread(increment())
}

pub fn atomic_counter() -> Machine {
    let code = vec![Op::AtomicAdd(0, 1), Op::Exit];
    Machine::new("atomic-counter", 1)
        .thread(code.clone())
        .thread(code)
}

/// Slot 0 is the counter, slot 1 counts finished workers. The checker
/// waits for both workers and asserts the counter reached 2, which fails
/// when one increment overwrites the other.
pub fn lost_update() -> Machine {
    let worker = vec![
        Op::Load(0),
        Op::Add(1),
        Op::Store(0),
        Op::AtomicAdd(1, 1),
        Op::Exit,
    ];
    let checker = vec![
        Op::Load(1),
        Op::Eq(2),
        Op::JumpIfZero(0),
        Op::Load(0),
        Op::Eq(2),
        Op::Assert,
        Op::Exit,
    ];
    Machine::new("lost-update", 2)
        .thread(worker.clone())
        .thread(worker)
        .thread(checker)
}

pub fn double_free() -> Machine {
    Machine::new("double-free", 1).thread(vec![
        Op::Malloc(8),
        Op::Free,
        Op::Trace("freed once".into()),
        Op::Free,
        Op::Exit,
    ])
}

pub fn choice() -> Machine {
    Machine::new("choice", 1).thread(vec![Op::Choose(3), Op::Store(0), Op::Accept, Op::Exit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Program;

    #[test]
    fn test_every_name_resolves() {
        for name in NAMES {
            let model = by_name(name).unwrap();
            assert_eq!(model.name(), *name);
            assert!(describe(name).is_some());
        }
        assert!(by_name("nope").is_none());
    }
}
