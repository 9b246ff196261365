// ============================================================================
// hydrobase command line
//
//   hydrobase run      --config model.json   run a simulation
//   hydrobase validate --config model.json   check config and inputs
//
// Log verbosity comes from --log-level unless RUST_LOG is set.
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hydrobase::{AsciiGridStore, GridStore, Simulation, SimulationConfig};

const SUMMARY_FILE: &str = "run_summary.json";

#[derive(Parser)]
#[command(name = "hydrobase")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cell-based rainfall-runoff and groundwater model", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run(ConfigArgs),
    /// Validate a configuration and its inputs
    Validate(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Validate(args) => validate(args),
    }
}

fn load(path: &Path) -> Result<SimulationConfig> {
    let config = SimulationConfig::load(path)
        .with_context(|| format!("loading configuration {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn store_for(config: &SimulationConfig) -> AsciiGridStore {
    AsciiGridStore::new(&config.paths.input_dir, &config.paths.output_dir)
        .with_cellsize(config.model.resolution)
}

fn run(args: ConfigArgs) -> Result<()> {
    let config = load(&args.config)?;
    let output_dir = config.paths.output_dir.clone();
    let store = store_for(&config);

    let started = Instant::now();
    let mut sim = Simulation::from_store(config, store).context("preparing simulation")?;
    let summary = sim.run().context("simulation failed")?;

    info!(
        elapsed = ?started.elapsed(),
        substeps = summary.substeps,
        outflow_m3 = summary.balance.outflow,
        relative_error = summary.relative_error,
        "done"
    );

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let path = output_dir.join(SUMMARY_FILE);
    let json = serde_json::to_string_pretty(&summary)?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "summary written");
    Ok(())
}

fn validate(args: ConfigArgs) -> Result<()> {
    let config = load(&args.config)?;
    let store = store_for(&config);
    let paths = &config.paths;

    let mut missing = Vec::new();
    for name in [&paths.dem, &paths.land_use, &paths.soil] {
        if !store.exists(name) {
            error!(input = %store.input_path(name).display(), "required map not found");
            missing.push(name.clone());
        }
    }
    let mode = config.routing.mode;
    let optional = [
        (&paths.initial_groundwater, mode.routes_subsurface()),
        (&paths.initial_height, mode.routes_surface()),
        (&paths.initial_discharge, mode.routes_surface()),
        (&paths.initial_interception, true),
    ];
    let used = optional
        .into_iter()
        .filter_map(|(name, used)| used.then_some(name));
    for name in used.chain(paths.ldd.as_ref()) {
        if !store.exists(name) {
            warn!(input = %store.input_path(name).display(), "optional map not found, default will be derived");
        }
    }
    for table in [&paths.soil_table, &paths.land_use_table] {
        if !table.is_file() {
            warn!(table = %table.display(), "lookup table not found, defaults will be used");
        }
    }

    if !missing.is_empty() {
        bail!("missing required inputs: {}", missing.join(", "));
    }
    info!(
        mode = %config.routing.mode,
        substeps = config.time.total_substeps(),
        "configuration is valid"
    );
    Ok(())
}
