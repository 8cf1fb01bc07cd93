//! Command-line interface for the strata model checker.

use std::time::Instant;

use clap::{Parser, Subcommand};
use strata_mc::{
    BuildError, Builder, BuilderConfig, Label, NoSolver, Search, SearchConfig, SearchOutcome,
    State,
};
use strata_vm::machine::{Machine, EXITED};
use strata_vm::{models, ContextConfig, FaultPolicy};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum CliError {
    #[error("unknown model '{name}' (try `strata list`)")]
    UnknownModel { name: String },

    #[error("exploration failed: {0}")]
    Build(#[from] BuildError),
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "strata", version)]
#[command(about = "Explicit-state model checker for the bundled machine models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explore every reachable state of a model
    Explore {
        /// Model name (see `strata list`)
        #[arg(value_name = "MODEL")]
        model: String,

        /// Number of worker threads (0 = all cores)
        #[arg(long, default_value = "0")]
        threads: usize,

        /// Disable parallel exploration
        #[arg(long)]
        no_parallel: bool,

        /// Maximum number of states to store (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_states: usize,

        /// Keep exploring after an error state is found
        #[arg(long)]
        keep_going: bool,

        /// Keep interpreting a run after it faults
        #[arg(long)]
        continue_on_fault: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },
    /// List the bundled models
    List,
}

fn main() {
    let cli = Cli::parse();

    let filter = if matches!(&cli.command, Commands::Explore { verbose: true, .. }) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let result = match cli.command {
        Commands::Explore {
            model,
            threads,
            no_parallel,
            max_states,
            keep_going,
            continue_on_fault,
            verbose: _,
        } => cmd_explore(
            &model,
            threads,
            !no_parallel,
            max_states,
            !keep_going,
            continue_on_fault,
        ),
        Commands::List => {
            cmd_list();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn cmd_list() {
    for name in models::NAMES {
        println!("{:<16} {}", name, models::describe(name).unwrap_or(""));
    }
}

fn format_state(state: &State, builder: &Builder<Machine, NoSolver>) -> String {
    let root = builder.root();
    let snap = state.snapshot();
    let model = builder.program();
    let globals: Vec<String> = (0..model.slot_count())
        .map(|slot| match Machine::global(snap, root, slot) {
            Some(v) => v.to_string(),
            None => "?".into(),
        })
        .collect();
    let threads: Vec<String> = (0..model.thread_count())
        .map(|tid| match Machine::thread_state(snap, root, tid) {
            Some((EXITED, _)) => format!("t{tid}:exited"),
            Some((pc, acc)) => format!("t{tid}:pc={pc},acc={acc}"),
            None => format!("t{tid}:?"),
        })
        .collect();
    format!("globals=[{}] {}", globals.join(", "), threads.join(" "))
}

fn format_label(label: Option<&Label>) -> String {
    match label {
        None => "init".into(),
        Some(label) => label.to_string(),
    }
}

fn cmd_explore(
    name: &str,
    num_threads: usize,
    parallel: bool,
    max_states: usize,
    stop_on_error: bool,
    continue_on_fault: bool,
) -> CliResult<()> {
    let model = models::by_name(name).ok_or_else(|| CliError::UnknownModel {
        name: name.to_string(),
    })?;

    let config = BuilderConfig {
        context: ContextConfig {
            fault_policy: if continue_on_fault {
                FaultPolicy::Continue
            } else {
                FaultPolicy::EndRun
            },
        },
        ..Default::default()
    };
    let builder = Builder::new(model, config)?;

    info!(model = name, "exploring...");
    let start = Instant::now();
    let mut search = Search::new(
        builder,
        SearchConfig {
            parallel,
            num_threads,
            max_states,
            stop_on_error,
            progress: None,
        },
    );
    let outcome = search.run()?;
    let elapsed = start.elapsed();
    let instructions = search.builder().stats().instructions();

    match outcome {
        SearchOutcome::Ok {
            states,
            edges,
            errors,
            max_depth,
        } => {
            println!();
            println!("Result: {}", if errors == 0 { "OK" } else { "ERRORS" });
            println!("  States: {}", states);
            println!("  Edges: {}", edges);
            println!("  Error edges: {}", errors);
            println!("  Max depth: {}", max_depth);
            println!("  Instructions: {}", instructions);
            println!("  Time: {:.2}s", elapsed.as_secs_f64());
            if errors > 0 {
                std::process::exit(1);
            }
        }
        SearchOutcome::Error { trace } => {
            println!();
            println!("Result: ERROR STATE REACHED");
            println!("  Trace ({} steps):", trace.len());
            for (i, (state, label)) in trace.iter().enumerate() {
                println!(
                    "    {}: {} -> {}",
                    i,
                    format_label(label.as_ref()),
                    format_state(state, search.builder())
                );
            }
            std::process::exit(1);
        }
        SearchOutcome::StateLimitReached { states, max_depth } => {
            println!();
            println!("Result: STATE LIMIT REACHED");
            println!("  States: {}", states);
            println!("  Max depth: {}", max_depth);
            println!("  Time: {:.2}s", elapsed.as_secs_f64());
            std::process::exit(2);
        }
    }

    Ok(())
}
