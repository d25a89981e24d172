//! Class-incremental learning experiment runner.
//!
//! Loads a run configuration (TOML, or JSON for `.json` files), resolves the
//! compute device and runs every configured seed through the experiment
//! driver. Exits with an error if any seed failed.

mod backend;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cil_core::{init_logging, load_config_file, resolve_devices, RunConfig};
use cil_incremental::{ExperimentDriver, RunSummary};
use colored::Colorize;
use tracing::{info, warn};

use crate::backend::{backend_name, device_for, TrainingBackend};

/// Class-incremental learning experiment runner
#[derive(Parser, Debug)]
#[command(
    name = "cil-train",
    about = "Run class-incremental learning experiments",
    long_about = "Train a network on a sequence of class-incremental tasks, one independent \
                  repetition per seed, and report head and nearest-mean-of-exemplars accuracy \
                  after every task."
)]
struct Args {
    /// Path to the run configuration (TOML, or JSON with a .json extension)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override the seed list (comma-separated)
    #[arg(long, value_name = "SEEDS", value_delimiter = ',')]
    seed: Option<Vec<u64>>,

    /// Override the device list (comma-separated, -1 for the unified-memory device)
    #[arg(
        long,
        value_name = "IDS",
        value_delimiter = ',',
        allow_negative_numbers = true
    )]
    device: Option<Vec<i64>>,

    /// Override the log directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Validate the configuration without training
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let sink = init_logging(args.verbose).context("Failed to initialize logging")?;

    let config: RunConfig = load_config_file(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;
    let config = apply_overrides(config, &args);
    config.validate().context("Invalid configuration")?;

    let devices = resolve_devices(&config.device).context("Invalid device list")?;
    let primary = devices[0];
    if devices.len() > 1 {
        warn!(
            "Training runs on {} only; ignoring {:?}",
            primary,
            &devices[1..]
        );
    }
    info!("Backend: {} on {}", backend_name(), primary);

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let summary = ExperimentDriver::<TrainingBackend>::new(config, device_for(primary))
        .with_log_sink(sink)
        .run()
        .context("Experiment could not start")?;

    print_summary(&summary);

    let failed = summary.failed_seeds();
    if !failed.is_empty() {
        anyhow::bail!("{} seed(s) failed: {:?}", failed.len(), failed);
    }
    Ok(())
}

fn apply_overrides(mut config: RunConfig, args: &Args) -> RunConfig {
    if let Some(seed) = &args.seed {
        config.seed = seed.clone();
    }
    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(output) = &args.output {
        config.output.log_dir = output.clone();
    }
    config
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Run summary".bold());
    for outcome in &summary.outcomes {
        let cnn = outcome
            .average_cnn_top1()
            .map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));
        let nme = outcome
            .average_nme_top1()
            .map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));
        let status = match &outcome.error {
            None => "ok".green(),
            Some(_) if outcome.device_failure => "device failure".red(),
            Some(_) => "failed".red(),
        };
        println!(
            "  seed {:>6}  tasks {:>3}  avg CNN {:>6}  avg NME {:>6}  {}",
            outcome.seed, outcome.tasks_completed, cnn, nme, status
        );
        if let Some(err) = &outcome.error {
            println!("    {}", err.dimmed());
        }
    }
    if let Some(mean) = summary.mean_cnn_top1() {
        println!("  {} {:.2}", "Mean average CNN accuracy:".cyan(), mean);
    }
}
