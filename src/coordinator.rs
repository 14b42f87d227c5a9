// 🧵 Concurrency Coordinator - bounded worker pool over fund codes
//
// Each worker pulls one fund code at a time from a shared queue and runs it
// to completion:
//   polite delay -> fetch (timeout + retry) -> normalize -> drop orphans
//   -> arbitrate -> type holdings -> append to work files -> mark finished
// Cancellation is observed only between units, so a unit is either fully
// written and marked, or not marked at all.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::arbitration::SourceArbitrator;
use crate::checkpoint::{pending_units, CheckpointStore};
use crate::config::PolitenessConfig;
use crate::error::{Result, SyncError};
use crate::fetch::{FragmentSource, RawUnit};
use crate::normalizer::{filter_orphans, HoldingTypeCache, ParseReport};
use crate::records::UnitRecords;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::snapshot::WorkFiles;

/// Everything the workers share. Each mutable piece has its own lock.
pub struct CoordinatorContext {
    pub source: Arc<dyn FragmentSource>,
    pub arbitrator: SourceArbitrator,
    /// Master key set of this run
    pub master_keys: HashSet<String>,
    pub work_files: Arc<WorkFiles>,
    pub checkpoint: Arc<dyn CheckpointStore>,
    pub holding_types: Arc<HoldingTypeCache>,
    pub politeness: PolitenessConfig,
    pub retry: RetryConfig,
    pub fetch_timeout: Duration,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorReport {
    /// Units already finished by an earlier run today
    pub resumed: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: Vec<String>,
    pub rows_written: usize,
    pub orphans_dropped: usize,
    pub nulled_fields: usize,
    pub dropped_rows: usize,
    pub cancelled: bool,
}

struct UnitOutcome {
    rows_written: usize,
    orphans_dropped: usize,
    parse: ParseReport,
}

pub struct Coordinator {
    ctx: Arc<CoordinatorContext>,
    workers: usize,
}

impl Coordinator {
    pub fn new(ctx: CoordinatorContext, workers: usize) -> Self {
        Coordinator {
            ctx: Arc::new(ctx),
            workers: workers.max(1),
        }
    }

    pub fn context(&self) -> &CoordinatorContext {
        &self.ctx
    }

    /// Run every unit of `units` not yet finished today.
    pub async fn run(&self, units: &[String]) -> CoordinatorReport {
        let pending = pending_units(self.ctx.checkpoint.as_ref(), units);
        let report = Arc::new(Mutex::new(CoordinatorReport {
            resumed: units.len() - pending.len(),
            ..CoordinatorReport::default()
        }));

        info!(
            "🧵 {} units pending ({} already finished), {} workers",
            pending.len(),
            units.len() - pending.len(),
            self.workers
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(pending)));
        let handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                let ctx = Arc::clone(&self.ctx);
                let queue = Arc::clone(&queue);
                let report = Arc::clone(&report);
                tokio::spawn(async move { worker_loop(worker, ctx, queue, report).await })
            })
            .collect();

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                error!("worker task aborted: {}", e);
            }
        }

        let mut report = report.lock().unwrap_or_else(PoisonError::into_inner).clone();
        report.cancelled = self.ctx.cancel.is_cancelled();
        report
    }
}

async fn worker_loop(
    worker: usize,
    ctx: Arc<CoordinatorContext>,
    queue: Arc<Mutex<VecDeque<String>>>,
    report: Arc<Mutex<CoordinatorReport>>,
) {
    let mut first = true;
    loop {
        if ctx.cancel.is_cancelled() {
            debug!(worker, "cancellation observed, stopping");
            break;
        }

        if !first {
            let delay = ctx.politeness.jittered_delay();
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        first = false;

        let Some(unit) = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front() else {
            break;
        };
        bump(&report, |r| r.dispatched += 1);

        match process_unit(&ctx, &unit).await {
            Ok(outcome) => {
                debug!(worker, unit = %unit, rows = outcome.rows_written, "unit finished");
                bump(&report, |r| {
                    r.completed += 1;
                    r.rows_written += outcome.rows_written;
                    r.orphans_dropped += outcome.orphans_dropped;
                    r.nulled_fields += outcome.parse.nulled_fields;
                    r.dropped_rows += outcome.parse.dropped_rows;
                });
            }
            Err(e) => {
                error!("❌ {} failed: {}", unit, e);
                bump(&report, |r| r.failed.push(unit.clone()));
            }
        }
    }
}

fn bump<F: FnOnce(&mut CoordinatorReport)>(report: &Mutex<CoordinatorReport>, update: F) {
    update(&mut report.lock().unwrap_or_else(PoisonError::into_inner));
}

async fn process_unit(ctx: &Arc<CoordinatorContext>, unit: &str) -> Result<UnitOutcome> {
    let raw = retry_with_backoff(&ctx.retry, unit, |_attempt| fetch_once(ctx, unit)).await?;
    debug!(unit = %raw.fund_code, rows = raw.row_count(), "fetched raw rows");

    let mut parse = ParseReport::default();
    let candidates = raw.normalize(&mut parse);
    let (candidates, orphans_dropped) = drop_orphans(candidates, &ctx.master_keys);
    let mut merged = ctx.arbitrator.arbitrate(candidates);
    let typed = ctx.holding_types.fill(&mut merged.holdings);
    if typed > 0 {
        debug!(unit = %unit, typed, "classified holdings");
    }

    let writer = Arc::clone(ctx);
    let unit_key = unit.to_string();
    let rows_written = tokio::task::spawn_blocking(move || -> Result<usize> {
        let written = writer.work_files.append_unit(&merged)?;
        writer.checkpoint.mark_finished(&unit_key)?;
        Ok(written)
    })
    .await
    .map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))??;

    Ok(UnitOutcome {
        rows_written,
        orphans_dropped,
        parse,
    })
}

/// One bounded fetch attempt, run off the async workers.
async fn fetch_once(ctx: &Arc<CoordinatorContext>, unit: &str) -> Result<RawUnit> {
    let source = Arc::clone(&ctx.source);
    let code = unit.to_string();
    let handle = tokio::task::spawn_blocking(move || source.fetch_unit(&code));

    match tokio::time::timeout(ctx.fetch_timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SyncError::transient(unit, format!("fetch task failed: {}", join_err))),
        Err(_) => {
            warn!("{}: fetch timed out after {:?}", unit, ctx.fetch_timeout);
            Err(SyncError::transient(unit, format!("timed out after {:?}", ctx.fetch_timeout)))
        }
    }
}

fn drop_orphans(unit: UnitRecords, master_keys: &HashSet<String>) -> (UnitRecords, usize) {
    let (fees, a) = filter_orphans(unit.fees, master_keys);
    let (holdings, b) = filter_orphans(unit.holdings, master_keys);
    let (allocations, c) = filter_orphans(unit.allocations, master_keys);
    let (navs, d) = filter_orphans(unit.navs, master_keys);
    let (codes, e) = filter_orphans(unit.codes, master_keys);
    let (statistics, f) = filter_orphans(unit.statistics, master_keys);
    (
        UnitRecords {
            funds: unit.funds,
            fees,
            holdings,
            allocations,
            navs,
            codes,
            statistics,
        },
        a + b + c + d + e + f,
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::normalizer::{HoldingType, RawRow};
    use crate::records::Table;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-memory source; `flaky` units fail transiently N times first
    #[derive(Default)]
    struct FakeSource {
        units: HashMap<String, RawUnit>,
        flaky: Mutex<HashMap<String, usize>>,
        broken: HashSet<String>,
        fetched: Mutex<Vec<String>>,
        cancel_after_first: Option<CancellationToken>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn with_units(codes: &[&str]) -> Self {
            let mut source = FakeSource::default();
            for code in codes {
                let mut unit = RawUnit::new(code);
                unit.push(
                    Table::Funds,
                    RawRow::from_iter([("fund_code", *code), ("source", "finnomena"), ("amc", "KAsset")]),
                );
                unit.push(
                    Table::DailyNav,
                    RawRow::from_iter([
                        ("fund_code", *code),
                        ("source", "finnomena"),
                        ("nav_date", "2024-05-01"),
                        ("nav_value", "10.5"),
                    ]),
                );
                source.units.insert(code.to_string(), unit);
            }
            source
        }
    }

    impl FragmentSource for FakeSource {
        fn master_keys(&self) -> Result<Vec<String>> {
            let mut keys: Vec<String> = self.units.keys().cloned().collect();
            keys.sort();
            Ok(keys)
        }

        fn fetch_unit(&self, fund_code: &str) -> Result<RawUnit> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(token) = &self.cancel_after_first {
                    token.cancel();
                }
            }
            self.fetched.lock().unwrap().push(fund_code.to_string());

            if self.broken.contains(fund_code) {
                return Err(SyncError::transient(fund_code, "HTTP 503"));
            }
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(fund_code) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SyncError::transient(fund_code, "connection reset"));
                }
            }
            Ok(self.units.get(fund_code).cloned().unwrap_or_else(|| RawUnit::new(fund_code)))
        }
    }

    fn create_test_coordinator(
        source: Arc<FakeSource>,
        checkpoint: Arc<dyn CheckpointStore>,
        dir: &TempDir,
        workers: usize,
        cancel: CancellationToken,
    ) -> Coordinator {
        let master_keys = source.master_keys().unwrap().into_iter().collect();
        let ctx = CoordinatorContext {
            source,
            arbitrator: SourceArbitrator::new(),
            master_keys,
            work_files: Arc::new(WorkFiles::open(dir.path(), true).unwrap()),
            checkpoint,
            holding_types: Arc::new(HoldingTypeCache::new()),
            politeness: PolitenessConfig {
                min_delay_ms: 0,
                max_delay_ms: 1,
            },
            retry: RetryConfig::fixed(Duration::from_millis(1), 2),
            fetch_timeout: Duration::from_secs(5),
            cancel,
        };
        Coordinator::new(ctx, workers)
    }

    fn keys(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_all_units_complete_and_are_marked() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::with_units(&["K1", "K2", "K3", "K4"]));
        let checkpoint: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let coordinator =
            create_test_coordinator(source, checkpoint.clone(), &dir, 3, CancellationToken::new());

        let report = coordinator.run(&keys(&["K1", "K2", "K3", "K4"])).await;

        assert_eq!(report.completed, 4);
        assert_eq!(report.rows_written, 8);
        assert!(report.failed.is_empty());
        assert_eq!(checkpoint.finished_count(), 4);
        assert_eq!(coordinator.context().work_files.funds.load().unwrap().count(), 4);
    }

    #[tokio::test]
    async fn test_untyped_holdings_are_classified_before_write() {
        let dir = TempDir::new().unwrap();
        let mut fake = FakeSource::with_units(&["K1"]);
        let unit = fake.units.get_mut("K1").unwrap();
        for name in ["Apple Inc (AAPL)", "Cash & Deposit", "Mystery Holdings (MYST)"] {
            unit.push(
                Table::Holdings,
                RawRow::from_iter([("fund_code", "K1"), ("source", "wealthmagik"), ("name", name)]),
            );
        }
        let checkpoint: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let coordinator =
            create_test_coordinator(Arc::new(fake), checkpoint, &dir, 1, CancellationToken::new());
        coordinator.context().holding_types.insert(
            "AAPL",
            HoldingType {
                holding_type: "Stock (US)".to_string(),
                sector: Some("Technology".to_string()),
                symbol: Some("AAPL".to_string()),
            },
        );

        let report = coordinator.run(&keys(&["K1"])).await;
        assert_eq!(report.completed, 1);

        let holdings = coordinator.context().work_files.holdings.load().unwrap();
        let type_of = |name: &str| {
            holdings
                .records()
                .find(|h| h.name == name)
                .and_then(|h| h.holding_type.clone())
        };
        assert_eq!(type_of("Apple Inc (AAPL)").as_deref(), Some("Stock (US)"));
        assert_eq!(type_of("Cash & Deposit").as_deref(), Some("Other"));
        assert_eq!(type_of("Mystery Holdings (MYST)"), None);
    }

    #[tokio::test]
    async fn test_resume_dispatches_only_unfinished() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::with_units(&["K1", "K2", "K3"]));
        let checkpoint: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        checkpoint.mark_finished("K1").unwrap();
        checkpoint.mark_finished("K2").unwrap();

        let coordinator =
            create_test_coordinator(source.clone(), checkpoint, &dir, 3, CancellationToken::new());
        let report = coordinator.run(&keys(&["K1", "K2", "K3"])).await;

        assert_eq!(report.resumed, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(*source.fetched.lock().unwrap(), keys(&["K3"]));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_isolated() {
        let dir = TempDir::new().unwrap();
        let mut fake = FakeSource::with_units(&["K1", "K2", "K3"]);
        fake.flaky.lock().unwrap().insert("K1".to_string(), 1);
        fake.broken.insert("K2".to_string());
        let source = Arc::new(fake);
        let checkpoint: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

        let coordinator =
            create_test_coordinator(source.clone(), checkpoint.clone(), &dir, 2, CancellationToken::new());
        let report = coordinator.run(&keys(&["K1", "K2", "K3"])).await;

        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, keys(&["K2"]));
        assert!(checkpoint.is_finished("K1"));
        assert!(!checkpoint.is_finished("K2"));
        // K2: one try + two retries
        let k2_calls = source.fetched.lock().unwrap().iter().filter(|c| *c == "K2").count();
        assert_eq!(k2_calls, 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_units() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut fake = FakeSource::with_units(&["K1", "K2", "K3"]);
        fake.cancel_after_first = Some(cancel.clone());
        let checkpoint: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

        let coordinator = create_test_coordinator(Arc::new(fake), checkpoint.clone(), &dir, 1, cancel);
        let report = coordinator.run(&keys(&["K1", "K2", "K3"])).await;

        // The unit in flight still finishes and is durably marked
        assert!(report.cancelled);
        assert_eq!(report.completed, 1);
        assert_eq!(checkpoint.finished_units().len(), 1);
        assert!(checkpoint.is_finished("K1"));
    }

    #[test]
    fn test_orphans_are_dropped_per_unit() {
        let mut unit = RawUnit::new("K1");
        unit.push(
            Table::Holdings,
            RawRow::from_iter([("fund_code", "GHOST"), ("name", "Apple"), ("source", "sec")]),
        );
        let mut parse = ParseReport::default();
        let master: HashSet<String> = ["K1".to_string()].into();
        let (records, dropped) = drop_orphans(unit.normalize(&mut parse), &master);
        assert_eq!(dropped, 1);
        assert!(records.holdings.is_empty());
    }
}
