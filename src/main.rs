use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use ormsync::{Engine, EngineConfig, SyncOptions, SyncOutcome};

/// Reconcile the live database schema with the schema definitions.
#[derive(Debug, Parser)]
#[command(name = "dbsync", version, about)]
struct Args {
    /// Engine config file (servers, definitions path, cache).
    #[arg(short, long, env = "ORMSYNC_CONFIG", default_value = "ormsync.json")]
    config: PathBuf,

    /// Print the DDL instead of executing it.
    #[arg(long)]
    dry_run: bool,

    /// Print every statement and per-table status.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = EngineConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let engine = Engine::from_config(&config).context("Failed to start engine")?;

    let mut sync = engine
        .synchronizer(SyncOptions {
            dry_run: args.dry_run,
            verbose: args.verbose,
        })
        .context("Failed to load schema definitions")?;

    let outcome = sync.run().context("Schema sync failed")?;
    if args.verbose {
        println!("{}", summary(&outcome, args.dry_run));
    }
    Ok(())
}

/// One-line summary printed after a verbose run. A quiet run prints nothing.
fn summary(outcome: &SyncOutcome, dry_run: bool) -> String {
    match outcome {
        SyncOutcome::NothingToSync => "Nothing to sync".to_string(),
        SyncOutcome::Completed(report) if report.is_empty() => "Schema is up to date".to_string(),
        SyncOutcome::Completed(report) => format!(
            "{} {} statement(s)",
            if dry_run { "Planned" } else { "Executed" },
            report.statements.len()
        ),
    }
}
