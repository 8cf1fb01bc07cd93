//! Breadth-first reachability over a [`Builder`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rayon::prelude::*;
use strata_vm::Program;
use tracing::{info, warn};

use crate::builder::{Builder, State};
use crate::label::Label;
use crate::solver::Solver;
use crate::BuildResult;

/// How a state was first reached.
#[derive(Debug, Clone)]
pub struct StateInfo {
    /// None for the initial state.
    pub predecessor: Option<State>,
    /// Label of the edge from the predecessor.
    pub label: Option<Label>,
    pub depth: usize,
}

/// Lock-free progress counters shared between the search and the CLI.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub states: AtomicUsize,
    pub edges: AtomicUsize,
    pub depth: AtomicUsize,
    pub queue_len: AtomicUsize,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Configuration for a [`Search`].
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Expand a frontier batch with one builder clone per rayon worker.
    pub parallel: bool,
    /// Worker threads for parallel search (0 = rayon's default).
    pub num_threads: usize,
    /// Maximum number of states to store (0 = unlimited).
    pub max_states: usize,
    /// Stop at the first edge whose run faulted.
    pub stop_on_error: bool,
    pub progress: Option<Arc<ProgressCounters>>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            num_threads: 0,
            max_states: 0,
            stop_on_error: true,
            progress: None,
        }
    }
}

/// Result of a search.
#[derive(Debug)]
pub enum SearchOutcome {
    /// Every reachable state was visited.
    Ok {
        states: usize,
        edges: usize,
        errors: usize,
        max_depth: usize,
    },
    /// A faulting edge was found. The trace leads from the initial state
    /// to the state the faulting edge produced.
    Error { trace: Vec<(State, Option<Label>)> },
    /// Stopped at the state limit.
    StateLimitReached { states: usize, max_depth: usize },
}

type QueueEntry = (State, usize);

/// One expanded state: successors not seen before, and the first faulting
/// edge if any.
struct Expansion {
    fresh: Vec<QueueEntry>,
    edges: usize,
    errors: usize,
    error_at: Option<State>,
}

/// Breadth-first search over the states of a builder.
pub struct Search<P, S> {
    builder: Builder<P, S>,
    config: SearchConfig,
    store: DashMap<State, StateInfo>,
}

impl<P: Program, S: Solver> Search<P, S> {
    pub fn new(builder: Builder<P, S>, config: SearchConfig) -> Self {
        Self {
            builder,
            config,
            store: DashMap::new(),
        }
    }

    pub fn builder(&self) -> &Builder<P, S> {
        &self.builder
    }

    /// Every visited state and how it was first reached.
    pub fn store(&self) -> &DashMap<State, StateInfo> {
        &self.store
    }

    /// Path from the initial state to `state`, each state paired with the
    /// label of the edge that reached it.
    pub fn trace_to(&self, state: &State) -> Vec<(State, Option<Label>)> {
        let mut trace = Vec::new();
        let mut current = Some(state.clone());
        while let Some(s) = current {
            let Some(info) = self.store.get(&s).map(|r| r.clone()) else {
                break;
            };
            trace.push((s, info.label));
            current = info.predecessor;
        }
        trace.reverse();
        trace
    }

    fn expand(
        builder: &mut Builder<P, S>,
        store: &DashMap<State, StateInfo>,
        state: &State,
        depth: usize,
    ) -> BuildResult<Expansion> {
        let mut out = Expansion {
            fresh: Vec::new(),
            edges: 0,
            errors: 0,
            error_at: None,
        };
        builder.edges(state, |next, label, new| {
            out.edges += 1;
            if label.error {
                out.errors += 1;
            }
            let error = label.error;
            if new {
                store.insert(
                    next.clone(),
                    StateInfo {
                        predecessor: Some(state.clone()),
                        label: Some(label),
                        depth: depth + 1,
                    },
                );
                out.fresh.push((next.clone(), depth + 1));
            }
            if error && out.error_at.is_none() {
                out.error_at = Some(next);
            }
        })?;
        builder.sync();
        Ok(out)
    }

    /// Explore every state reachable from the initial state.
    pub fn run(&mut self) -> BuildResult<SearchOutcome> {
        if self.config.parallel && self.config.num_threads > 0 {
            if let Err(e) = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.num_threads)
                .build_global()
            {
                warn!(error = %e, "could not configure rayon thread pool");
            }
        }
        info!(
            program = self.builder.program().name(),
            parallel = self.config.parallel,
            threads = if self.config.parallel {
                rayon::current_num_threads()
            } else {
                1
            },
            "starting search"
        );

        let mut queue: VecDeque<QueueEntry> = VecDeque::new();
        let store = &self.store;
        self.builder.initials(|s| {
            store.insert(
                s.clone(),
                StateInfo {
                    predecessor: None,
                    label: None,
                    depth: 0,
                },
            );
            queue.push_back((s, 0));
        });

        let (mut edges, mut errors, mut max_depth) = (0usize, 0usize, 0usize);
        let stop = AtomicBool::new(false);
        let stop_on_error = self.config.stop_on_error;
        let batch_size = rayon::current_num_threads() * 64;

        while !queue.is_empty() {
            if self.config.max_states > 0 && self.store.len() >= self.config.max_states {
                info!(states = self.store.len(), "reached state limit");
                return Ok(SearchOutcome::StateLimitReached {
                    states: self.store.len(),
                    max_depth,
                });
            }

            let results: Vec<BuildResult<Expansion>> = if self.config.parallel {
                let batch: Vec<QueueEntry> = queue.drain(..queue.len().min(batch_size)).collect();
                let builder = &self.builder;
                batch
                    .par_iter()
                    .map_init(
                        || builder.clone(),
                        |b, (state, depth)| {
                            if stop.load(Ordering::Relaxed) {
                                return Ok(Expansion {
                                    fresh: Vec::new(),
                                    edges: 0,
                                    errors: 0,
                                    error_at: None,
                                });
                            }
                            let out = Self::expand(b, store, state, *depth);
                            if stop_on_error
                                && out.as_ref().map_or(true, |o| o.error_at.is_some())
                            {
                                stop.store(true, Ordering::Relaxed);
                            }
                            out
                        },
                    )
                    .collect()
            } else {
                let Some((state, depth)) = queue.pop_front() else {
                    break;
                };
                vec![Self::expand(&mut self.builder, store, &state, depth)]
            };

            for result in results {
                let out = result?;
                edges += out.edges;
                errors += out.errors;
                if let Some(at) = out.error_at.filter(|_| stop_on_error) {
                    info!(states = self.store.len(), "error state reached");
                    return Ok(SearchOutcome::Error {
                        trace: self.trace_to(&at),
                    });
                }
                for (state, depth) in out.fresh {
                    max_depth = max_depth.max(depth);
                    queue.push_back((state, depth));
                }
            }

            if let Some(p) = &self.config.progress {
                p.states.store(self.store.len(), Ordering::Relaxed);
                p.edges.store(edges, Ordering::Relaxed);
                p.depth.store(max_depth, Ordering::Relaxed);
                p.queue_len.store(queue.len(), Ordering::Relaxed);
            }
        }

        info!(
            states = self.store.len(),
            edges,
            errors,
            max_depth,
            instructions = self.builder.stats().instructions(),
            "search complete"
        );
        Ok(SearchOutcome::Ok {
            states: self.store.len(),
            edges,
            errors,
            max_depth,
        })
    }
}
