// 🔀 fund-merge - crawl output -> canonical merged snapshots
//
// Resumable: units finished today are skipped on rerun.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fund_sync::{
    init_tracing, is_skip_day, run_merge_stage, CsvFragmentSource, ErrorCapture, MergeSummary,
    PipelineConfig,
};

/// Merge per-source fund fragments into one snapshot per table
#[derive(Parser, Debug)]
#[command(name = "fund-merge", version)]
struct Args {
    /// Pipeline config (JSON); defaults are used when absent
    #[arg(long, default_value = "pipeline.json")]
    config: PathBuf,

    /// Resolve relative paths against this directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,

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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let capture = ErrorCapture::new();
    init_tracing(capture.clone())?;

    let run_date = args.date.unwrap_or_else(|| Local::now().date_naive());
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Config load failed: {:#}", e);
            let log_dir = PipelineConfig::fallback_log_dir(args.root.as_deref());
            if let Some(path) = capture.flush_if_errors(&log_dir, "merge", run_date)? {
                eprintln!("📝 Errors occurred, log saved to {}", path.display());
            }
            return Err(e);
        }
    };

    let outcome = run(&args, &config, run_date).await;
    if let Err(e) = &outcome {
        error!("❌ Merge failed: {:#}", e);
    }

    if let Some(path) = capture.flush_if_errors(&config.paths.log_dir, "merge", run_date)? {
        eprintln!("📝 Errors occurred, log saved to {}", path.display());
    }

    if let Some(summary) = outcome? {
        print_summary(&summary, args.json)?;
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_for_stage(&args.config, args.root.as_deref())?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: &Args, config: &PipelineConfig, run_date: NaiveDate) -> Result<Option<MergeSummary>> {
    if !args.force && is_skip_day(config, run_date)? {
        info!("📅 {} is a skip day, nothing to do", run_date);
        return Ok(None);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight units");
            on_signal.cancel();
        }
    });

    let source = CsvFragmentSource::open(&config.paths.raw_dir)
        .with_context(|| format!("Failed to open raw dir {:?}", config.paths.raw_dir))?;
    info!("🔀 Merging {} sources from {:?}", source.sources().len(), config.paths.raw_dir);

    let summary = run_merge_stage(config, Arc::new(source), run_date, cancel).await?;
    Ok(Some(summary))
}

fn print_summary(summary: &MergeSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", summary.render());
    }
    Ok(())
}
