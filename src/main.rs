use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use loan_atlas::{
    dataset_exists, export_dataset, HarvestConfig, HarvestError, Harvester, HttpGeocoder, HttpSource, Renderer,
    StateStore, VERSION,
};

const LOG_FILE: &str = "harvest.log";

#[derive(Parser, Debug)]
#[command(
    name = "loan-atlas",
    version = VERSION,
    about = "Map where lenders are and where the loans they fund go"
)]
struct Cli {
    /// Root for harvest state and exported datasets
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Per-record failures tolerated before a run aborts
    #[arg(long, global = true)]
    max_errors: Option<usize>,

    /// Also append log output to <data-dir>/harvest.log
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Harvest one lender's loans and draw the map
    Lender {
        /// Lender id, e.g. seand
        id: String,

        /// Re-fetch even if an exported dataset already exists
        #[arg(long)]
        refresh: bool,
    },

    /// Harvest a lending team's loans and draw the map
    Team {
        /// Team short name, e.g. buildkiva
        name: String,

        #[arg(long)]
        refresh: bool,
    },

    /// Fold bulk snapshot files, resuming at the saved cursor
    Snapshot {
        /// Stop after this many files that contributed at least one loan
        count: usize,

        /// Directory holding <n>.json snapshot files
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage problems are not failures
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ERROR: {:#}", err);
            return ExitCode::from(1);
        }
    };

    if let Err(err) = init_logging(&config, cli.log_file) {
        eprintln!("ERROR: {:#}", err);
        return ExitCode::from(1);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        eprintln!("\n⚠️  Interrupt received. Saving state and exiting...");
    })
    .unwrap_or_else(|e| {
        warn!(error = %e, "Failed to set Ctrl-C handler");
    });

    match run(cli.command, config, interrupted) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<HarvestError>() {
            Some(HarvestError::Interrupted) => {
                eprintln!("⚠️  Interrupted. Progress so far has been saved.");
                ExitCode::from(130)
            }
            _ => {
                eprintln!("ERROR: {:#}", err);
                ExitCode::from(1)
            }
        },
    }
}

fn build_config(cli: &Cli) -> Result<HarvestConfig> {
    let mut config = HarvestConfig::from_env()?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(max_errors) = cli.max_errors {
        config.max_errors = max_errors;
    }
    Ok(config)
}

fn init_logging(config: &HarvestConfig, log_file: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("loan_atlas=info".parse()?);

    if log_file {
        std::fs::create_dir_all(&config.data_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.data_dir.join(LOG_FILE))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::io::stderr.and(Arc::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn run(command: Commands, config: HarvestConfig, interrupted: Arc<AtomicBool>) -> Result<()> {
    config.log_summary();

    match command {
        Commands::Lender { id, refresh } => run_live(&config, Mode::Lender, &id, refresh, interrupted),
        Commands::Team { name, refresh } => run_live(&config, Mode::Team, &name, refresh, interrupted),
        Commands::Snapshot { count, dir } => run_snapshots(config, dir, count, interrupted),
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Lender,
    Team,
}

fn run_live(config: &HarvestConfig, mode: Mode, run_id: &str, refresh: bool, interrupted: Arc<AtomicBool>) -> Result<()> {
    if !refresh && dataset_exists(&config.data_dir, run_id) {
        info!(run_id, "Dataset already exists, skipping harvest (use --refresh to re-fetch)");
    } else {
        let store = StateStore::new(config.data_dir.join(run_id));
        let mut harvester = Harvester::open(config, store, HttpSource::new()?, HttpGeocoder::new(config)?)?
            .with_interrupt(interrupted);

        let report = match mode {
            Mode::Lender => harvester.harvest_lender(run_id)?,
            Mode::Team => harvester.harvest_team(run_id)?,
        };
        println!("✓ {}", report.summary());

        export_dataset(&config.data_dir, run_id, &harvester.state().graph)?;
    }

    Renderer::new(config.renderer.clone()).render(run_id)?;
    println!("🗺️  Map drawn for {}", run_id);
    Ok(())
}

fn run_snapshots(config: HarvestConfig, dir: Option<PathBuf>, count: usize, interrupted: Arc<AtomicBool>) -> Result<()> {
    let config = config.for_snapshots();
    let dir = dir.unwrap_or_else(|| config.snapshot_dir.clone());

    let store = StateStore::new(&config.data_dir);
    let mut harvester = Harvester::open(&config, store, HttpSource::new()?, HttpGeocoder::new(&config)?)?
        .with_interrupt(interrupted);

    let report = harvester.harvest_snapshots(&dir, count)?;
    println!("✓ {} batch(es): {}", report.batches, report.summary());
    println!("  Next snapshot file: {}", harvester.ledger().cursor());
    Ok(())
}
