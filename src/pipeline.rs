// 🚦 Pipeline Stages - fund-merge and fund-sync
//
// fund-merge: raw fragments -> canonical merged snapshots (resumable)
// fund-sync:  merged snapshots vs baselines -> changesets -> datastore
//
// Both stages derive every decision from durable state (checkpoint log,
// work files, baselines), so either can be re-run after a crash.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{PathsConfig, PipelineConfig};
use crate::coordinator::{Coordinator, CoordinatorContext, CoordinatorReport};
use crate::db::{open_database, SyncApplier};
use crate::diff::DiffEngine;
use crate::error::SyncError;
use crate::fetch::FragmentSource;
use crate::normalizer::{filter_orphans, HoldingTypeCache};
use crate::records::{
    AllocationRecord, CodeRecord, DailyNavRecord, FeeRecord, FundRecord, HoldingRecord,
    StatisticsRecord, Table, TableRecord,
};
use crate::snapshot::{write_changeset, Snapshot, SnapshotSink, WorkFiles};

/// True when `date` falls on a configured skip weekday
pub fn is_skip_day(config: &PipelineConfig, date: NaiveDate) -> Result<bool> {
    Ok(config.schedule.skips(date.weekday())?)
}

// ============================================================================
// MERGE STAGE
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub run_date: NaiveDate,
    pub units_total: usize,
    #[serde(flatten)]
    pub coordinator: CoordinatorReport,
    /// Dependent rows whose fund is not in the master snapshot
    pub orphans_skipped: usize,
    /// Rows copied from the baseline for failed units
    pub carried_forward: usize,
    /// Rows per merged table; empty when the run was cancelled
    pub merged_rows: BTreeMap<Table, usize>,
    pub finalized: bool,
    pub elapsed_secs: f64,
}

impl MergeSummary {
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("📊 Merge summary for {}", self.run_date),
            format!(
                "   units: {} total, {} resumed, {} done, {} failed",
                self.units_total,
                self.coordinator.resumed,
                self.coordinator.completed,
                self.coordinator.failed.len()
            ),
            format!(
                "   orphans dropped: {}, parse nulls: {}, rows dropped: {}",
                self.orphans_skipped + self.coordinator.orphans_dropped,
                self.coordinator.nulled_fields,
                self.coordinator.dropped_rows
            ),
        ];
        if !self.coordinator.failed.is_empty() {
            lines.push(format!("   failed units: {}", self.coordinator.failed.join(", ")));
        }
        if self.finalized {
            for (table, rows) in &self.merged_rows {
                lines.push(format!("   {:<12} {:>8} rows", table.name(), rows));
            }
            if self.carried_forward > 0 {
                lines.push(format!("   carried forward: {} rows", self.carried_forward));
            }
        } else {
            lines.push("   ⚠️  cancelled: merged snapshot not written, rerun to resume".to_string());
        }
        lines.push(format!("   elapsed: {:.1}s", self.elapsed_secs));
        lines.join("\n")
    }
}

pub async fn run_merge_stage(
    config: &PipelineConfig,
    source: Arc<dyn FragmentSource>,
    run_date: NaiveDate,
    cancel: CancellationToken,
) -> Result<MergeSummary> {
    let started = Instant::now();
    let paths = &config.paths;

    let units = source.master_keys()?;
    let master_keys: HashSet<String> = units.iter().cloned().collect();
    let orphans_skipped = source.count_orphans(&master_keys);
    info!("🔍 {} funds in master snapshot", units.len());

    let checkpoint = Arc::new(
        FileCheckpointStore::open(&paths.checkpoint_file, run_date)
            .context("Failed to open checkpoint log")?,
    );
    let fresh = checkpoint.finished_count() == 0;
    let work_files = Arc::new(
        WorkFiles::open(&paths.work_dir, fresh).context("Failed to open work files")?,
    );

    let holding_types = Arc::new(
        HoldingTypeCache::load_csv(&paths.holding_types)
            .context("Failed to load holding type lookup")?,
    );

    let coordinator = Coordinator::new(
        CoordinatorContext {
            source,
            arbitrator: config.arbitration.arbitrator(),
            master_keys,
            work_files: Arc::clone(&work_files),
            checkpoint: checkpoint.clone(),
            holding_types,
            politeness: config.politeness.clone(),
            retry: config.fetch.retry_config(),
            fetch_timeout: config.fetch.timeout(),
            cancel,
        },
        config.workers,
    );
    let report = coordinator.run(&units).await;
    drop(coordinator);

    let mut summary = MergeSummary {
        run_date,
        units_total: units.len(),
        coordinator: report,
        orphans_skipped,
        carried_forward: 0,
        merged_rows: BTreeMap::new(),
        finalized: false,
        elapsed_secs: 0.0,
    };

    if summary.coordinator.cancelled {
        warn!("⚠️  Merge cancelled; checkpoint and work files kept for resume");
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        return Ok(summary);
    }

    let failed: HashSet<String> = summary.coordinator.failed.iter().cloned().collect();
    finalize_merge(&work_files, paths, &failed, &mut summary)?;
    summary.finalized = true;

    if failed.is_empty() {
        checkpoint.clear().context("Failed to clear checkpoint log")?;
        match Arc::try_unwrap(work_files) {
            Ok(files) => files.remove().context("Failed to remove work files")?,
            Err(_) => warn!("Work files still in use, leaving them in place"),
        }
        info!("🧹 All units succeeded; checkpoint and work files removed");
    } else {
        warn!(
            "{} units failed; checkpoint kept so a rerun today retries only those",
            failed.len()
        );
    }

    summary.elapsed_secs = started.elapsed().as_secs_f64();
    Ok(summary)
}

fn finalize_merge(
    work_files: &WorkFiles,
    paths: &PathsConfig,
    failed: &HashSet<String>,
    summary: &mut MergeSummary,
) -> Result<()> {
    finalize_table(&work_files.funds, paths, failed, summary)?;
    finalize_table(&work_files.fees, paths, failed, summary)?;
    finalize_table(&work_files.holdings, paths, failed, summary)?;
    finalize_table(&work_files.allocations, paths, failed, summary)?;
    finalize_table(&work_files.navs, paths, failed, summary)?;
    finalize_table(&work_files.codes, paths, failed, summary)?;
    finalize_table(&work_files.statistics, paths, failed, summary)?;
    Ok(())
}

/// Collapse one work file by key, fill failed units from the baseline,
/// write the merged snapshot.
fn finalize_table<R: TableRecord>(
    sink: &SnapshotSink<R>,
    paths: &PathsConfig,
    failed: &HashSet<String>,
    summary: &mut MergeSummary,
) -> Result<()> {
    let mut merged = sink
        .load()
        .with_context(|| format!("Failed to read work file {:?}", sink.path()))?;

    if !failed.is_empty() {
        let baseline: Snapshot<R> =
            Snapshot::read_csv_or_empty(&paths.baseline_dir.join(R::TABLE.file_name()))?;
        let carried = merged.carry_forward(&baseline, failed);
        if carried > 0 {
            info!("{}: carried {} rows forward for failed units", R::TABLE, carried);
        }
        summary.carried_forward += carried;
    }

    merged
        .write_csv(&paths.merged_dir.join(R::TABLE.file_name()))
        .with_context(|| format!("Failed to write merged {} snapshot", R::TABLE))?;
    summary.merged_rows.insert(R::TABLE, merged.count());
    Ok(())
}

// ============================================================================
// SYNC STAGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum TableStatus {
    Applied,
    Failed(String),
    /// No merged snapshot for this table
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSyncSummary {
    pub table: Table,
    pub adds: usize,
    pub deletes: usize,
    pub orphans_dropped: usize,
    pub status: TableStatus,
}

impl TableSyncSummary {
    fn skipped(table: Table) -> Self {
        TableSyncSummary {
            table,
            adds: 0,
            deletes: 0,
            orphans_dropped: 0,
            status: TableStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_date: NaiveDate,
    pub deleted_funds: Vec<String>,
    pub tables: Vec<TableSyncSummary>,
    pub elapsed_secs: f64,
}

impl SyncSummary {
    pub fn failed_tables(&self) -> Vec<Table> {
        self.tables
            .iter()
            .filter(|t| matches!(t.status, TableStatus::Failed(_)))
            .map(|t| t.table)
            .collect()
    }

    pub fn render(&self) -> String {
        let mut lines = vec![format!("📊 Sync summary for {}", self.run_date)];
        for t in &self.tables {
            let status = match &t.status {
                TableStatus::Applied => "applied".to_string(),
                TableStatus::Failed(reason) => format!("FAILED ({})", reason),
                TableStatus::Skipped => "skipped (no merged snapshot)".to_string(),
            };
            lines.push(format!(
                "   {:<12} ADD {:>6}  DELETE {:>6}  orphans {:>4}  {}",
                t.table.name(),
                t.adds,
                t.deletes,
                t.orphans_dropped,
                status
            ));
        }
        if !self.deleted_funds.is_empty() {
            lines.push(format!("   deactivated funds: {}", self.deleted_funds.join(", ")));
        }
        lines.push(format!("   elapsed: {:.1}s", self.elapsed_secs));
        lines.join("\n")
    }
}

pub fn run_sync_stage(config: &PipelineConfig, run_date: NaiveDate) -> Result<SyncSummary> {
    let started = Instant::now();
    let paths = &config.paths;

    let funds_path = paths.merged_dir.join(Table::Funds.file_name());
    let new_funds = Snapshot::<FundRecord>::read_csv(&funds_path)
        .with_context(|| format!("Failed to read {:?}", funds_path))?
        .ok_or_else(|| SyncError::MissingMasterSnapshot(funds_path.clone()))?;
    let master_keys = new_funds.fund_codes();

    let mut conn = open_database(&paths.database)
        .with_context(|| format!("Failed to open database {:?}", paths.database))?;
    let changeset_dir = paths
        .changeset_dir
        .join(run_date.format("%Y-%m-%d").to_string());
    std::fs::create_dir_all(&changeset_dir)
        .with_context(|| format!("Failed to create {:?}", changeset_dir))?;

    let engine = DiffEngine::new();
    let mut run = SyncRun {
        conn: &mut conn,
        engine: &engine,
        paths,
        changeset_dir: &changeset_dir,
        master_keys: &master_keys,
    };

    // Master first: its diff fills the deleted-fund set used by the cascade
    let tables = vec![
        run.table(Some(new_funds)),
        run.table_from_disk::<FeeRecord>(),
        run.table_from_disk::<HoldingRecord>(),
        run.table_from_disk::<AllocationRecord>(),
        run.table_from_disk::<DailyNavRecord>(),
        run.table_from_disk::<CodeRecord>(),
        run.table_from_disk::<StatisticsRecord>(),
    ];

    let summary = SyncSummary {
        run_date,
        deleted_funds: engine.deleted_funds().to_set().into_iter().collect(),
        tables,
        elapsed_secs: started.elapsed().as_secs_f64(),
    };

    let failed = summary.failed_tables();
    if failed.is_empty() {
        info!("✅ Sync complete");
    } else {
        warn!("Sync finished with {} failed tables; they retry next run", failed.len());
    }
    Ok(summary)
}

struct SyncRun<'a> {
    conn: &'a mut Connection,
    engine: &'a DiffEngine,
    paths: &'a PathsConfig,
    changeset_dir: &'a Path,
    master_keys: &'a HashSet<String>,
}

impl SyncRun<'_> {
    fn table_from_disk<R: TableRecord>(&mut self) -> TableSyncSummary {
        let path = self.paths.merged_dir.join(R::TABLE.file_name());
        match Snapshot::<R>::read_csv(&path) {
            Ok(Some(snapshot)) => self.table(Some(snapshot)),
            Ok(None) => self.table::<R>(None),
            Err(e) => {
                error!("{}: cannot read merged snapshot {:?}: {}", R::TABLE, path, e);
                TableSyncSummary {
                    status: TableStatus::Failed(e.to_string()),
                    ..TableSyncSummary::skipped(R::TABLE)
                }
            }
        }
    }

    fn table<R: TableRecord>(&mut self, new: Option<Snapshot<R>>) -> TableSyncSummary {
        let Some(new) = new else {
            warn!("{}: no merged snapshot, table skipped", R::TABLE);
            return TableSyncSummary::skipped(R::TABLE);
        };

        match self.sync_table(new) {
            Ok(summary) => summary,
            Err(e) => {
                error!("{}: sync failed: {}", R::TABLE, e);
                TableSyncSummary {
                    status: TableStatus::Failed(e.to_string()),
                    ..TableSyncSummary::skipped(R::TABLE)
                }
            }
        }
    }

    fn sync_table<R: TableRecord>(&mut self, new: Snapshot<R>) -> crate::error::Result<TableSyncSummary> {
        let label = new.label.clone();
        let (rows, orphans_dropped) = filter_orphans(new.into_records(), self.master_keys);
        let new = Snapshot::from_rows(label, rows);

        let baseline_path = self.paths.baseline_dir.join(R::TABLE.file_name());
        let baseline = Snapshot::<R>::read_csv_or_empty(&baseline_path)?;

        let changeset = self.engine.diff(&baseline, &new);
        write_changeset(self.changeset_dir, &changeset)?;

        let mut summary = TableSyncSummary {
            table: R::TABLE,
            adds: changeset.add_count(),
            deletes: changeset.delete_count(),
            orphans_dropped,
            status: TableStatus::Applied,
        };

        match SyncApplier::new(self.conn).apply(&changeset) {
            Ok(_) => new.write_csv(&baseline_path)?,
            Err(e) => summary.status = TableStatus::Failed(e.to_string()),
        }
        Ok(summary)
    }
}

// ============================================================================
// TESTS
// ============================================================================
