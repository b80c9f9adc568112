//! trafficsync command-line front end.
//!
//! Diffs two snapshots of a traffic-incident feed and applies the result to
//! a local event store, printing the sync report as JSON.
//!
//! Usage:
//!   trafficsync --db events.db --old before.json --new after.json
//!   trafficsync --db events.db --differential changes.json --no-atomic
//!   trafficsync --db events.db --optimize

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{fs, path::Path, path::PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use trafficsync_storage::EventStore;
use trafficsync_sync::{ApplyOptions, DifferentialSyncEngine, SyncConfig, SyncWorker};
use trafficsync_types::{parse_records, Differential, EventRecord};

#[derive(Parser, Debug)]
#[command(name = "trafficsync")]
#[command(about = "Differential sync for live traffic-incident feeds")]
struct Args {
    /// Path to the event store database
    #[arg(long, default_value = "trafficsync.db")]
    db: PathBuf,

    /// Previous snapshot (JSON array of records)
    #[arg(long, requires = "new", conflicts_with = "differential")]
    old: Option<PathBuf>,

    /// Current snapshot (JSON array of records)
    #[arg(long, requires = "old")]
    new: Option<PathBuf>,

    /// Apply a precomputed differential instead of diffing snapshots
    #[arg(long)]
    differential: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Commit batches one by one instead of all-or-nothing
    #[arg(long)]
    no_atomic: bool,

    /// Skip the integrity check before writing, overriding the config
    #[arg(long)]
    skip_validation: bool,

    /// Print the differential without applying it
    #[arg(long)]
    dry_run: bool,

    /// Purge expired diff-log entries afterwards
    #[arg(long)]
    optimize: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = engine_config(&args)?;

    let store = EventStore::open(&args.db)
        .with_context(|| format!("failed to open event store {}", args.db.display()))?;
    info!("Event store: {}", args.db.display());
    let worker = SyncWorker::spawn(DifferentialSyncEngine::new(store, config)?)?;

    let differential = match (&args.old, &args.new, &args.differential) {
        (Some(old), Some(new), _) => {
            let old = load_snapshot(old)?;
            let new = load_snapshot(new)?;
            Some(worker.calculate_differential(old, new).await?)
        }
        (_, _, Some(path)) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read differential {}", path.display()))?;
            Some(serde_json::from_str::<Differential>(&raw).context("invalid differential")?)
        }
        _ if args.optimize => None,
        _ => bail!("nothing to do: pass --old and --new, --differential, or --optimize"),
    };

    if let Some(differential) = differential {
        if args.dry_run {
            println!("{}", serde_json::to_string_pretty(&differential)?);
        } else {
            let report = worker
                .apply_differential(differential, apply_options(&args))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    if args.optimize {
        worker.optimize().await?;
    }

    worker.shutdown().await?;
    Ok(())
}

/// Loads the engine configuration, with command-line overrides applied.
fn engine_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            SyncConfig::from_json(&raw).context("invalid config")?
        }
        None => SyncConfig::default(),
    };
    if args.skip_validation {
        config.validate_integrity = false;
    }
    Ok(config)
}

fn apply_options(args: &Args) -> ApplyOptions {
    ApplyOptions {
        atomic: !args.no_atomic,
        validate_first: !args.skip_validation,
    }
}

fn load_snapshot(path: &Path) -> Result<Vec<EventRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let parsed = parse_records(&raw)
        .with_context(|| format!("snapshot {} is not a JSON array", path.display()))?;
    for rejected in &parsed.rejected {
        warn!(
            "Skipping record {} in {}: {}",
            rejected.index,
            path.display(),
            rejected.reason
        );
    }
    info!("Loaded {} records from {}", parsed.records.len(), path.display());
    Ok(parsed.records)
}
