//! CLI Entry Point for rust-fluidics
//!
//! Provides command-line interface for:
//! - Running a protocol, once or once per round
//! - Validating a configuration and sequence file without touching hardware
//! - Estimating the duration of a protocol
//!
//! # Usage
//!
//! ```bash
//! rust-fluidics run --config fluidics.json --sequences merfish.csv --rounds 7,8,9
//! rust-fluidics run --config fluidics.json --sequences merfish.csv --simulate --section 0:3
//! rust-fluidics validate --config fluidics.json --sequences merfish.csv
//! rust-fluidics estimate --config fluidics.json --sequences merfish.csv --json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_fluidics::engine::{RunStatus, TimeEstimate};
use rust_fluidics::hardware::{DeviceMode, SimulationOptions};
use rust_fluidics::logging::{self, LoggingConfig};
use rust_fluidics::{Fluidics, FluidicsConfig, RunSection, SequenceTable};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "rust-fluidics")]
#[command(about = "Fluidics sequence runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the included rows of a sequence file
    Run {
        /// Configuration file (.json or .toml)
        #[arg(long)]
        config: PathBuf,

        /// Sequence CSV file
        #[arg(long)]
        sequences: PathBuf,

        /// Use simulated devices
        #[arg(long)]
        simulate: bool,

        /// Give simulated devices hardware-like timing
        #[arg(long, requires = "simulate")]
        realistic: bool,

        /// Reagent port per round; the protocol runs once per entry
        #[arg(long, value_delimiter = ',')]
        rounds: Vec<u32>,

        /// Restrict the run to active rows start:end
        #[arg(long)]
        section: Option<RunSection>,
    },

    /// Check configuration and sequence file
    Validate {
        /// Configuration file (.json or .toml)
        #[arg(long)]
        config: PathBuf,

        /// Sequence CSV file
        #[arg(long)]
        sequences: PathBuf,
    },

    /// Print the estimated run time
    Estimate {
        /// Configuration file (.json or .toml)
        #[arg(long)]
        config: PathBuf,

        /// Sequence CSV file
        #[arg(long)]
        sequences: PathBuf,

        /// Print the estimate as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            sequences,
            simulate,
            realistic,
            rounds,
            section,
        } => {
            let mode = match (simulate, realistic) {
                (false, _) => DeviceMode::Hardware,
                (true, false) => DeviceMode::Simulated(SimulationOptions::instant()),
                (true, true) => DeviceMode::Simulated(SimulationOptions::realistic()),
            };
            run(&config, &sequences, mode, rounds, section).await
        }
        Commands::Validate { config, sequences } => validate(&config, &sequences).await,
        Commands::Estimate {
            config,
            sequences,
            json,
        } => estimate(&config, &sequences, json),
    }
}

fn load_config(path: &Path) -> Result<FluidicsConfig> {
    let config = FluidicsConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init(LoggingConfig::from_section(&config.logging)?)
        .context("Failed to initialize logging")?;
    Ok(config)
}

fn load_sequences(path: &Path) -> Result<SequenceTable> {
    SequenceTable::from_csv_path(path)
        .with_context(|| format!("Failed to load sequences from {}", path.display()))
}

async fn run(
    config_path: &Path,
    sequence_path: &Path,
    mode: DeviceMode,
    rounds: Vec<u32>,
    section: Option<RunSection>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let sequences = load_sequences(sequence_path)?;

    let fluidics = Fluidics::builder()
        .config(config)
        .sequences(sequences)
        .mode(mode)
        .build()?;

    let state = fluidics
        .scoped(move |f| {
            Box::pin(async move {
                if !rounds.is_empty() {
                    f.set_rounds(rounds);
                }
                f.run_rounds(section).await
            })
        })
        .await
        .context("Fluidics run failed")?;

    let status = state.map_or(RunStatus::Idle, |state| state.status);
    info!(%status, "Run finished");
    if status != RunStatus::Completed {
        bail!("Run ended as {}", status);
    }
    Ok(())
}

async fn validate(config_path: &Path, sequence_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let sequences = load_sequences(sequence_path)?;
    let capacity = config.selector_valves.port_capacity();

    let fluidics = Fluidics::builder()
        .config(config)
        .sequences(sequences)
        .simulated(SimulationOptions::instant())
        .build()?;

    let problems = fluidics
        .scoped(move |f| {
            Box::pin(async move {
                let mut problems = Vec::new();
                if let (Some(operations), Some(table)) = (f.operation_set(), f.sequences()) {
                    let rows = table.active_rows(None);
                    problems.extend(operations.check_rows(&rows).iter().map(ToString::to_string));
                    for (index, row) in rows.iter().enumerate() {
                        if row.fluidic_port > capacity {
                            problems.push(format!(
                                "Row {} ({}): port {} exceeds valve capacity {}",
                                index, row.sequence_name, row.fluidic_port, capacity
                            ));
                        }
                    }
                }
                Ok(problems)
            })
        })
        .await?;

    if problems.is_empty() {
        println!("Configuration and sequences are valid");
        return Ok(());
    }
    for problem in &problems {
        eprintln!("{}", problem);
    }
    bail!("{} problem(s) found", problems.len())
}

fn estimate(config_path: &Path, sequence_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let sequences = load_sequences(sequence_path)?;
    let estimate = TimeEstimate::for_rows(&sequences.active_rows(None), config.engine.row_overhead_s);
    if json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    }
    println!(
        "Estimated time: {:.0} s ({:.1} min), sequences: {}",
        estimate.total_time_s,
        estimate.total_time_s / 60.0,
        estimate.sequence_count
    );
    Ok(())
}
