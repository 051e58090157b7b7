//! bifrost: command-line reduction of BIFROST NeXus files.
#![allow(clippy::uninlined_format_args, clippy::cast_precision_loss)]

use bifrost_core::{Unit, Variable};
use bifrost_io::{read_lookup_table, write_lookup_table, NexusFile, ReductionConfig};
use bifrost_spectrometer::{QProjection, SimulationResults, TimeOfFlightLookupTable};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    BifrostIo(#[from] bifrost_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] bifrost_core::Error),
}

/// Data reduction for the BIFROST indirect-geometry spectrometer.
#[derive(Parser)]
#[command(name = "bifrost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce a run to normalized events with energy and momentum transfer
    Reduce {
        /// Input NeXus file
        input: PathBuf,

        /// JSON reduction configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Load at most this many detector triplets
        #[arg(short, long)]
        detectors: Option<usize>,

        /// Simulated neutrons when no lookup table file is configured
        #[arg(long, default_value = "1000000")]
        neutrons: usize,
    },

    /// Convert Bragg peak monitor events to elastic momentum transfer
    Elastic {
        /// Input NeXus file
        input: PathBuf,

        /// JSON reduction configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Load at most this many detector triplets
        #[arg(short, long)]
        detectors: Option<usize>,

        /// Simulated neutrons when no lookup table file is configured
        #[arg(long, default_value = "1000000")]
        neutrons: usize,
    },

    /// List the components of a NeXus file
    Info {
        /// Input NeXus file
        input: PathBuf,
    },

    /// Build a time-of-flight lookup table from a source simulation
    LookupTable {
        /// Output HDF5 file
        #[arg(short, long)]
        output: PathBuf,

        /// JSON reduction configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of simulated neutrons
        #[arg(short, long, default_value = "1000000")]
        neutrons: usize,
    },
}

fn load_config(path: Option<&Path>) -> Result<ReductionConfig> {
    match path {
        Some(path) => {
            info!("Reading configuration {}", path.display());
            Ok(ReductionConfig::from_file(path)?)
        }
        None => Ok(ReductionConfig::bifrost_defaults()),
    }
}

fn build_lookup_table(config: &ReductionConfig, neutrons: usize) -> Result<TimeOfFlightLookupTable> {
    let start = Instant::now();
    let simulation = SimulationResults::from_source(&config.source.source(), neutrons);
    let table = config.lookup_table_builder().build(&simulation)?;
    info!(
        "Built {}x{} lookup table from {} neutrons in {:.2}s ({:.1}% masked)",
        table.distance.len(),
        table.time.len(),
        neutrons,
        start.elapsed().as_secs_f64(),
        100.0 * table.masked_fraction()
    );
    Ok(table)
}

fn print_range(name: &str, values: &Variable, unit: &Unit) -> Result<()> {
    let values = values.to_unit(unit)?;
    match (values.nanmin()?, values.nanmax()?) {
        (Some(lo), Some(hi)) => println!("{name}: {lo:.4} to {hi:.4} {unit}"),
        _ => println!("{name}: no finite values"),
    }
    Ok(())
}

fn lookup_table(config: &ReductionConfig, neutrons: usize) -> Result<TimeOfFlightLookupTable> {
    match &config.time_of_flight.lookup_table {
        Some(path) => Ok(read_lookup_table(path)?),
        None => build_lookup_table(config, neutrons),
    }
}

fn reduce(input: &Path, config: &ReductionConfig, detectors: Option<usize>, neutrons: usize) -> Result<()> {
    let start = Instant::now();
    let table = lookup_table(config, neutrons)?;
    let nexus = NexusFile::open(input)?;
    let run = nexus.load_run(config, detectors)?;
    let workflow = config.workflow(table);
    let reduced = workflow.reduce(&run)?;

    println!("File: {}", input.display());
    println!("Triplets: {}", run.triplets.len());
    println!("Events: {}", reduced.events.event_count());
    println!("Total normalized counts: {:.6e} {}", reduced.events.total(), reduced.events.unit());
    let events = &reduced.events;
    print_range("energy_transfer", &events.event_coord("energy_transfer")?, &Unit::MILLI_ELECTRON_VOLT)?;
    print_range(
        "|Q|",
        &events.event_coord("sample_table_momentum_transfer")?.norm()?,
        &Unit::INVERSE_ANGSTROM,
    )?;
    print_range("a3", &events.event_coord("a3")?, &Unit::DEGREE)?;

    match workflow.sqw_pixels(&reduced, &config.incident_energy_bins(), config.output.sqw_bins) {
        Ok(pixels) => println!("SQW pixels: {}", pixels.len()),
        Err(bifrost_core::Error::Unsupported(reason)) => warn!("No SQW pixels: {reason}"),
        Err(e) => return Err(e.into()),
    }
    println!("Reduced in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn elastic(input: &Path, config: &ReductionConfig, detectors: Option<usize>, neutrons: usize) -> Result<()> {
    let start = Instant::now();
    let table = lookup_table(config, neutrons)?;
    let nexus = NexusFile::open(input)?;
    let run = nexus.load_run(config, detectors)?;
    let workflow = config.workflow(table);
    let events = workflow.elastic_q_map_events(&run, &QProjection::default())?;

    println!("File: {}", input.display());
    println!("Events: {}", events.event_count());
    print_range("|Q|", &events.event_coord("Q")?, &Unit::INVERSE_ANGSTROM)?;
    print_range("Q_parallel", &events.event_coord("Q_parallel")?, &Unit::INVERSE_ANGSTROM)?;
    print_range(
        "Q_perpendicular",
        &events.event_coord("Q_perpendicular")?,
        &Unit::INVERSE_ANGSTROM,
    )?;
    println!("Converted in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn info(input: &Path) -> Result<()> {
    let nexus = NexusFile::open(input)?;
    println!("File: {}", input.display());
    let components = nexus.summary()?;
    println!("{:<45} | {:<20}", "Component", "Class");
    println!("{:-<68}", "");
    for component in &components {
        println!("{:<45} | {:<20}", component.path, component.nx_class);
    }
    let count = |class: &str| components.iter().filter(|c| c.nx_class == class).count();
    println!(
        "Detectors: {}, analyzers: {}, monitors: {}, choppers: {}",
        count("NXdetector"),
        count("NXcrystal"),
        count("NXmonitor"),
        count("NXdisk_chopper")
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Reduce {
            input,
            config,
            detectors,
            neutrons,
        } => {
            let config = load_config(config.as_deref())?;
            reduce(&input, &config, detectors, neutrons)?;
        }

        Commands::Elastic {
            input,
            config,
            detectors,
            neutrons,
        } => {
            let config = load_config(config.as_deref())?;
            elastic(&input, &config, detectors, neutrons)?;
        }

        Commands::Info { input } => info(&input)?,

        Commands::LookupTable {
            output,
            config,
            neutrons,
        } => {
            let config = load_config(config.as_deref())?;
            let table = build_lookup_table(&config, neutrons)?;
            write_lookup_table(&output, &table)?;
            println!("Wrote lookup table to {}", output.display());
        }
    }
    Ok(())
}
