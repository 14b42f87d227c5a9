// 📸 Snapshots - keyed, immutable views of one table at a point in time
//
// A snapshot maps BusinessKey -> record (last write wins on duplicates).
// On disk it is a canonical CSV whose header is the table's COLUMNS.
// Replacing a snapshot file is atomic: write to a temp file in the same
// directory, then rename over the target.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::diff::Changeset;
use crate::error::Result;
use crate::normalizer::{ParseReport, RawRow};
use crate::records::{
    AllocationRecord, BusinessKey, CodeRecord, DailyNavRecord, FeeRecord, FundRecord,
    HoldingRecord, StatisticsRecord, SyncAction, Table, TableRecord, UnitRecords,
};

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Snapshot - consistent view of one table
#[derive(Debug, Clone)]
pub struct Snapshot<R: TableRecord> {
    /// Unique snapshot ID
    pub snapshot_id: String,

    /// Where this snapshot came from (file path, "empty", ...)
    pub label: String,

    rows: BTreeMap<BusinessKey, R>,
}

impl<R: TableRecord> Snapshot<R> {
    pub fn new(label: impl Into<String>) -> Self {
        Snapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            rows: BTreeMap::new(),
        }
    }

    pub fn from_rows<I>(label: impl Into<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
    {
        let mut snapshot = Snapshot::new(label);
        for row in rows {
            snapshot.insert(row);
        }
        snapshot
    }

    /// Insert or replace by business key; returns the replaced row.
    pub fn insert(&mut self, row: R) -> Option<R> {
        self.rows.insert(row.business_key(), row)
    }

    pub fn get(&self, key: &BusinessKey) -> Option<&R> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &BusinessKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BusinessKey, &R)> {
        self.rows.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    pub fn into_records(self) -> Vec<R> {
        self.rows.into_values().collect()
    }

    /// Count rows in snapshot
    pub fn count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn fund_codes(&self) -> HashSet<String> {
        self.rows.values().map(|r| r.fund_code().to_string()).collect()
    }

    /// Copy baseline rows for the given funds into this snapshot where this
    /// snapshot has nothing for that key. Returns the number copied.
    pub fn carry_forward(&mut self, baseline: &Snapshot<R>, fund_codes: &HashSet<String>) -> usize {
        let mut carried = 0;
        for (key, row) in baseline.iter() {
            if fund_codes.contains(row.fund_code()) && !self.rows.contains_key(key) {
                self.rows.insert(key.clone(), row.clone());
                carried += 1;
            }
        }
        carried
    }

    // ========================================================================
    // FILE I/O
    // ========================================================================

    /// Load a snapshot CSV. A missing file is `Ok(None)`.
    pub fn read_csv(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        let mut report = ParseReport::default();
        let mut snapshot = Snapshot::new(path.display().to_string());

        for record in reader.records() {
            let record = record?;
            let raw = RawRow::from_csv(&headers, &record);
            if let Some(row) = R::from_raw(&raw, &mut report) {
                snapshot.insert(row);
            }
        }

        if report.dropped_rows > 0 || report.nulled_fields > 0 {
            warn!(
                "{}: {} rows dropped, {} fields nulled while loading",
                path.display(),
                report.dropped_rows,
                report.nulled_fields
            );
        }
        debug!("Loaded {} {} rows from {}", snapshot.count(), R::TABLE, path.display());
        Ok(Some(snapshot))
    }

    /// Load a snapshot CSV, or an empty snapshot if the file is missing.
    pub fn read_csv_or_empty(path: &Path) -> Result<Self> {
        Ok(Self::read_csv(path)?.unwrap_or_else(|| Snapshot::new("empty")))
    }

    /// Atomically write this snapshot as canonical CSV.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let rows: Vec<Vec<String>> = self.rows.values().map(|r| r.fields()).collect();
        write_atomic(path, R::COLUMNS, &rows)?;
        info!("💾 Wrote {} {} rows to {}", self.count(), R::TABLE, path.display());
        Ok(())
    }
}

/// Write header + rows to a temp file beside `path`, then rename over it.
fn write_atomic(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    {
        let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ============================================================================
// CHANGESET FILES
// ============================================================================

/// Write `changeset_<table>.csv` into `dir` with a leading sync_action column.
///
/// DELETE rows carry only the key columns; the rest are left empty.
pub fn write_changeset<R: TableRecord>(dir: &Path, changeset: &Changeset<R>) -> Result<PathBuf> {
    let path = dir.join(format!("changeset_{}.csv", R::TABLE.name()));

    let mut header = vec!["sync_action"];
    header.extend_from_slice(R::COLUMNS);

    let rows: Vec<Vec<String>> = changeset
        .rows
        .iter()
        .map(|change| {
            let mut line = vec![change.action.as_str().to_string()];
            let fields = change.record.fields();
            match change.action {
                SyncAction::Add => line.extend(fields),
                SyncAction::Delete => {
                    for (column, value) in R::COLUMNS.iter().zip(fields) {
                        if R::KEY_COLUMNS.contains(column) {
                            line.push(value);
                        } else {
                            line.push(String::new());
                        }
                    }
                }
            }
            line
        })
        .collect();

    write_atomic(&path, &header, &rows)?;
    Ok(path)
}

// ============================================================================
// WORK FILES (append-only, resumable)
// ============================================================================

/// SnapshotSink - append-only CSV for one table's merged rows
///
/// Shared by all workers; each append holds the sink's own lock.
pub struct SnapshotSink<R: TableRecord> {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: TableRecord> SnapshotSink<R> {
    /// Open for appending. `truncate` starts the file over.
    pub fn open(path: &Path, truncate: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let needs_header = truncate || fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = if truncate {
            OpenOptions::new().create(true).write(true).truncate(true).open(path)?
        } else {
            OpenOptions::new().create(true).append(true).open(path)?
        };

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer.write_record(R::COLUMNS)?;
            writer.flush()?;
        }

        Ok(SnapshotSink {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append rows and flush them to disk before returning.
    pub fn append(&self, rows: &[R]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for row in rows {
            writer.write_record(row.fields())?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(rows.len())
    }

    /// Read everything appended so far, collapsed by key.
    pub fn load(&self) -> Result<Snapshot<R>> {
        {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.flush()?;
        }
        Snapshot::read_csv_or_empty(&self.path)
    }
}

/// WorkFiles - one sink per table under the work directory
pub struct WorkFiles {
    pub funds: SnapshotSink<FundRecord>,
    pub fees: SnapshotSink<FeeRecord>,
    pub holdings: SnapshotSink<HoldingRecord>,
    pub allocations: SnapshotSink<AllocationRecord>,
    pub navs: SnapshotSink<DailyNavRecord>,
    pub codes: SnapshotSink<CodeRecord>,
    pub statistics: SnapshotSink<StatisticsRecord>,
}

impl WorkFiles {
    pub fn open(dir: &Path, truncate: bool) -> Result<Self> {
        Ok(WorkFiles {
            funds: SnapshotSink::open(&dir.join(Table::Funds.file_name()), truncate)?,
            fees: SnapshotSink::open(&dir.join(Table::Fees.file_name()), truncate)?,
            holdings: SnapshotSink::open(&dir.join(Table::Holdings.file_name()), truncate)?,
            allocations: SnapshotSink::open(&dir.join(Table::Allocations.file_name()), truncate)?,
            navs: SnapshotSink::open(&dir.join(Table::DailyNav.file_name()), truncate)?,
            codes: SnapshotSink::open(&dir.join(Table::Codes.file_name()), truncate)?,
            statistics: SnapshotSink::open(&dir.join(Table::Statistics.file_name()), truncate)?,
        })
    }

    /// Append one unit's canonical rows to every table's work file.
    pub fn append_unit(&self, unit: &UnitRecords) -> Result<usize> {
        let mut written = 0;
        written += self.funds.append(&unit.funds)?;
        written += self.fees.append(&unit.fees)?;
        written += self.holdings.append(&unit.holdings)?;
        written += self.allocations.append(&unit.allocations)?;
        written += self.navs.append(&unit.navs)?;
        written += self.codes.append(&unit.codes)?;
        written += self.statistics.append(&unit.statistics)?;
        Ok(written)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        vec![
            self.funds.path().to_path_buf(),
            self.fees.path().to_path_buf(),
            self.holdings.path().to_path_buf(),
            self.allocations.path().to_path_buf(),
            self.navs.path().to_path_buf(),
            self.codes.path().to_path_buf(),
            self.statistics.path().to_path_buf(),
        ]
    }

    /// Remove the work files after a clean finalize.
    pub fn remove(self) -> Result<()> {
        let paths = self.paths();
        drop(self);
        for path in paths {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Flush and fsync a plain file handle (used for small state files).
pub(crate) fn sync_file(file: &mut File) -> Result<()> {
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeRow;
    use crate::records::{FundStatus, Source};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn create_test_fund(code: &str, amc: &str) -> FundRecord {
        FundRecord {
            fund_code: code.to_string(),
            full_name_th: None,
            full_name_en: Some(format!("{} Fund", code)),
            amc: Some(amc.to_string()),
            category: Some("Equity".to_string()),
            risk_level: Some("6".to_string()),
            is_dividend: None,
            inception_date: NaiveDate::from_ymd_opt(2015, 3, 1),
            status: FundStatus::Active,
            source: Source::Finnomena,
            as_of: NaiveDate::from_ymd_opt(2024, 5, 1),
        }
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let snapshot = Snapshot::from_rows(
            "test",
            vec![create_test_fund("K-USA-A", "KAsset"), create_test_fund("K-USA-A", "KBank")],
        );
        assert_eq!(snapshot.count(), 1);
        assert_eq!(snapshot.records().next().unwrap().amc.as_deref(), Some("KBank"));
    }

    #[test]
    fn test_csv_write_then_read_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("merged").join("funds.csv");
        let snapshot = Snapshot::from_rows(
            "test",
            vec![create_test_fund("K-USA-A", "KAsset"), create_test_fund("SCBSET", "SCBAM")],
        );

        snapshot.write_csv(&path).unwrap();
        let loaded: Snapshot<FundRecord> = Snapshot::read_csv(&path).unwrap().unwrap();

        assert_eq!(loaded.count(), 2);
        let originals: Vec<FundRecord> = snapshot.into_records();
        assert_eq!(loaded.into_records(), originals);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Snapshot<FundRecord>> =
            Snapshot::read_csv(&dir.path().join("nope.csv")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_carry_forward_only_fills_gaps() {
        let baseline = Snapshot::from_rows(
            "baseline",
            vec![create_test_fund("K-USA-A", "Old"), create_test_fund("SCBSET", "Old")],
        );
        let mut merged = Snapshot::from_rows("merged", vec![create_test_fund("SCBSET", "New")]);

        let failed: HashSet<String> = ["K-USA-A".to_string(), "SCBSET".to_string()].into();
        let carried = merged.carry_forward(&baseline, &failed);

        assert_eq!(carried, 1);
        assert_eq!(merged.count(), 2);
        let scbset = merged.get(&BusinessKey::new(["SCBSET"])).unwrap();
        assert_eq!(scbset.amc.as_deref(), Some("New"));
    }

    #[test]
    fn test_sink_appends_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("funds.csv");

        let sink: SnapshotSink<FundRecord> = SnapshotSink::open(&path, true).unwrap();
        sink.append(&[create_test_fund("K-USA-A", "KAsset")]).unwrap();
        drop(sink);

        let sink: SnapshotSink<FundRecord> = SnapshotSink::open(&path, false).unwrap();
        sink.append(&[create_test_fund("SCBSET", "SCBAM")]).unwrap();
        assert_eq!(sink.load().unwrap().count(), 2);

        let sink: SnapshotSink<FundRecord> = SnapshotSink::open(&path, true).unwrap();
        assert_eq!(sink.load().unwrap().count(), 0, "truncate starts over");
    }

    #[test]
    fn test_changeset_delete_rows_keep_only_keys() {
        let dir = TempDir::new().unwrap();
        let fund = create_test_fund("GONE", "KAsset");
        let changeset = Changeset {
            table: Table::Funds,
            rows: vec![ChangeRow {
                action: SyncAction::Delete,
                key: fund.business_key(),
                record: fund,
            }],
        };

        let path = write_changeset(dir.path(), &changeset).unwrap();
        let content = fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("sync_action,fund_code,"));
        assert_eq!(lines.next().unwrap(), "DELETE,GONE,,,,,,,,,,");
    }
}
