// 📥 Fragment Sources - raw per-fund rows from every crawler's output
//
// Layout under the raw directory (one folder per source):
//   <raw_dir>/<source>/funds.csv          master rows
//   <raw_dir>/<source>/fees.csv           ... one file per table
//   <raw_dir>/<source>/nav/<fund>.csv     daily NAV history for one fund
//
// Table files are indexed once by fund_code. NAV files are read per unit,
// so they are the part that can fail transiently.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::normalizer::{normalize_rows, ParseReport, RawRow};
use crate::records::{Source, Table, UnitRecords};

// ============================================================================
// RAW UNIT
// ============================================================================

/// RawUnit - every source's raw rows for one fund
#[derive(Debug, Clone, Default)]
pub struct RawUnit {
    pub fund_code: String,
    rows: HashMap<Table, Vec<RawRow>>,
}

impl RawUnit {
    pub fn new(fund_code: &str) -> Self {
        RawUnit {
            fund_code: fund_code.to_string(),
            rows: HashMap::new(),
        }
    }

    pub fn push(&mut self, table: Table, row: RawRow) {
        self.rows.entry(table).or_default().push(row);
    }

    pub fn rows(&self, table: Table) -> &[RawRow] {
        self.rows.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn row_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    /// Typed per-source candidates for arbitration
    pub fn normalize(&self, report: &mut ParseReport) -> UnitRecords {
        UnitRecords {
            funds: normalize_rows(self.rows(Table::Funds), report),
            fees: normalize_rows(self.rows(Table::Fees), report),
            holdings: normalize_rows(self.rows(Table::Holdings), report),
            allocations: normalize_rows(self.rows(Table::Allocations), report),
            navs: normalize_rows(self.rows(Table::DailyNav), report),
            codes: normalize_rows(self.rows(Table::Codes), report),
            statistics: normalize_rows(self.rows(Table::Statistics), report),
        }
    }
}

// ============================================================================
// SOURCE TRAIT
// ============================================================================

/// FragmentSource - where units come from
///
/// Calls block; the coordinator runs them off the async workers.
pub trait FragmentSource: Send + Sync {
    /// Fund codes of the current master snapshot (sorted, unique).
    fn master_keys(&self) -> Result<Vec<String>>;

    /// All raw rows for one fund across sources.
    fn fetch_unit(&self, fund_code: &str) -> Result<RawUnit>;

    /// Dependent rows whose fund_code is outside `master_keys`. They are
    /// never dispatched; this only counts and logs them.
    fn count_orphans(&self, _master_keys: &HashSet<String>) -> usize {
        0
    }
}

// ============================================================================
// CSV SOURCE
// ============================================================================

type FundIndex = HashMap<String, Vec<RawRow>>;

pub struct CsvFragmentSource {
    raw_dir: PathBuf,
    sources: Vec<Source>,
    index: HashMap<(Source, Table), FundIndex>,
}

impl CsvFragmentSource {
    /// Index every source folder present under `raw_dir`.
    pub fn open(raw_dir: &Path) -> Result<Self> {
        let mut sources = Vec::new();
        let mut index = HashMap::new();

        for source in Source::ALL {
            let dir = raw_dir.join(source.code());
            if !dir.is_dir() {
                debug!("No raw folder for {}", source);
                continue;
            }
            sources.push(source);

            for table in Table::ALL {
                let path = dir.join(table.file_name());
                if !path.exists() {
                    continue;
                }
                let by_fund = index_file(&path, source)?;
                info!(
                    "📄 {} {}: {} funds from {}",
                    source,
                    table,
                    by_fund.len(),
                    path.display()
                );
                index.insert((source, table), by_fund);
            }
        }

        Ok(CsvFragmentSource {
            raw_dir: raw_dir.to_path_buf(),
            sources,
            index,
        })
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    fn nav_path(&self, source: Source, fund_code: &str) -> PathBuf {
        let file_name: String = fund_code
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect();
        self.raw_dir
            .join(source.code())
            .join("nav")
            .join(format!("{}.csv", file_name))
    }
}

impl FragmentSource for CsvFragmentSource {
    fn master_keys(&self) -> Result<Vec<String>> {
        let masters: Vec<&FundIndex> = self
            .sources
            .iter()
            .filter_map(|source| self.index.get(&(*source, Table::Funds)))
            .collect();

        if masters.is_empty() {
            return Err(SyncError::MissingMasterSnapshot(
                self.raw_dir.join("<source>").join(Table::Funds.file_name()),
            ));
        }

        let keys: BTreeSet<String> = masters
            .iter()
            .flat_map(|by_fund| by_fund.keys().cloned())
            .collect();
        Ok(keys.into_iter().collect())
    }

    fn fetch_unit(&self, fund_code: &str) -> Result<RawUnit> {
        let mut unit = RawUnit::new(fund_code);

        for source in &self.sources {
            for table in Table::ALL {
                if let Some(rows) = self.index.get(&(*source, table)).and_then(|i| i.get(fund_code)) {
                    for row in rows {
                        unit.push(table, row.clone());
                    }
                }
            }

            let nav_path = self.nav_path(*source, fund_code);
            if nav_path.exists() {
                let rows = read_rows(&nav_path, *source)
                    .map_err(|e| SyncError::transient(fund_code, format!("{}: {}", nav_path.display(), e)))?;
                for mut row in rows {
                    if row.fund_code().is_none() {
                        row.insert("fund_code", fund_code);
                    }
                    unit.push(Table::DailyNav, row);
                }
            }
        }

        Ok(unit)
    }

    fn count_orphans(&self, master_keys: &HashSet<String>) -> usize {
        let mut total = 0;
        for ((source, table), by_fund) in &self.index {
            if table.is_master() {
                continue;
            }
            let orphans: usize = by_fund
                .iter()
                .filter(|(code, _)| !master_keys.contains(*code))
                .map(|(_, rows)| rows.len())
                .sum();
            if orphans > 0 {
                warn!("{} {}: dropped {} orphan rows (fund_code not in master snapshot)", source, table, orphans);
            }
            total += orphans;
        }
        total
    }
}

fn read_rows(path: &Path, source: Source) -> Result<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(RawRow::from_csv(&headers, &record).with_source(source));
    }
    Ok(rows)
}

fn index_file(path: &Path, source: Source) -> Result<FundIndex> {
    let mut by_fund: FundIndex = HashMap::new();
    let mut keyless = 0;
    for row in read_rows(path, source)? {
        match row.fund_code().map(str::to_string) {
            Some(code) => by_fund.entry(code).or_default().push(row),
            None => keyless += 1,
        }
    }
    if keyless > 0 {
        warn!("{}: skipped {} rows without fund_code", path.display(), keyless);
    }
    Ok(by_fund)
}

// ============================================================================
// TESTS
// ============================================================================
