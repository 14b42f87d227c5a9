// 🔄 fund-sync - merged snapshots -> changesets -> datastore
//
// Diffs each table against its last synced baseline and applies the
// changeset. Master table first so deletions cascade.

use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use fund_sync::{init_tracing, is_skip_day, run_sync_stage, ErrorCapture, PipelineConfig, SyncSummary};

/// Apply the day's merged fund snapshots to the datastore
#[derive(Parser, Debug)]
#[command(name = "fund-sync", version)]
struct Args {
    /// Pipeline config (JSON); defaults are used when absent
    #[arg(long, default_value = "pipeline.json")]
    config: PathBuf,

    /// Resolve relative paths against this directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override the datastore path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Run date (YYYY-MM-DD), today by default
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Run even on a configured skip day
    #[arg(long)]
    force: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let capture = ErrorCapture::new();
    init_tracing(capture.clone())?;

    let run_date = args.date.unwrap_or_else(|| Local::now().date_naive());
    let mut config = match PipelineConfig::load_for_stage(&args.config, args.root.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Config load failed: {:#}", e);
            let log_dir = PipelineConfig::fallback_log_dir(args.root.as_deref());
            if let Some(path) = capture.flush_if_errors(&log_dir, "sync", run_date)? {
                eprintln!("📝 Errors occurred, log saved to {}", path.display());
            }
            return Err(e);
        }
    };
    if let Some(database) = &args.database {
        config.paths.database = database.clone();
    }

    let outcome = run(&args, &config, run_date);
    if let Err(e) = &outcome {
        error!("❌ Sync failed: {:#}", e);
    }

    if let Some(path) = capture.flush_if_errors(&config.paths.log_dir, "sync", run_date)? {
        eprintln!("📝 Errors occurred, log saved to {}", path.display());
    }

    if let Some(summary) = outcome? {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!("{}", summary.render());
        }
    }
    Ok(())
}

fn run(args: &Args, config: &PipelineConfig, run_date: NaiveDate) -> Result<Option<SyncSummary>> {
    if !args.force && is_skip_day(config, run_date)? {
        info!("📅 {} is a skip day, nothing to do", run_date);
        return Ok(None);
    }

    info!("🔄 Syncing merged snapshots into {:?}", config.paths.database);
    Ok(Some(run_sync_stage(config, run_date)?))
}
