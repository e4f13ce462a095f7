//! # linklab
//!
//! CLI driver for the linklab distance sweep.
//!
//! Selects a propagation loss model, sweeps the separation of a two-node
//! wireless link until throughput collapses to zero, and records one
//! (distance, RSS, throughput) row per iteration in a per-model CSV file.

use clap::Parser;
use linklab_runner::{run_sweep, PropagationModel, RunnerError, SweepConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// linklab - wireless link range characterization
#[derive(Parser, Debug)]
#[command(name = "linklab")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Index of the propagation loss model:
    /// 0 Friis, 1 FixedRss, 2 ThreeLogDistance, 3 TwoRayGround, 4 Nakagami
    #[arg(short, long, default_value = "0")]
    model: usize,

    /// Increment distance by this many meters after every iteration
    #[arg(short, long, default_value = "1.0")]
    increment: f64,

    /// Simulated duration of one iteration, in seconds
    #[arg(short, long, default_value = "3.0")]
    time: f64,

    /// Random seed; reruns with the same seed reproduce the same rows
    #[arg(short, long, default_value = "1")]
    seed: u64,

    /// Directory the per-model result file is written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Stop the sweep once this distance is reached, even if throughput is
    /// still nonzero. Without it the sweep only ends at zero throughput,
    /// which some models (e.g. FixedRss) never reach.
    #[arg(long)]
    max_distance: Option<f64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    // Initialize tracing with the RUST_LOG env filter; default to "info"
    // with --verbose, "warn" otherwise.
    let default_filter = if cli.verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Resolve the model ordinal before anything else; an invalid ordinal
    // must fail before simulation resources exist.
    let model = PropagationModel::from_ordinal(cli.model)?;

    let config = SweepConfig {
        model,
        increment_m: cli.increment,
        duration_s: cli.time,
        seed: cli.seed,
        output_dir: cli.output_dir,
        max_distance_m: cli.max_distance,
    };

    // Finish the current iteration and its row cleanly on Ctrl+C.
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl+C handler");

    let summary = run_sweep(&config, Some(stop_flag))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
