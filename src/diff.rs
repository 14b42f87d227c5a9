// 🔀 Diff Engine - old snapshot vs new snapshot, with cascade delete
//
// For one table:
//   ADD    = keys only in new, plus keys whose content changed
//   DELETE = keys only in old
//
// Diffing the master table records every deleted fund_code in a shared
// DeletedFundSet. Diffing a dependent table afterwards turns every row of a
// deleted fund (old or new side) into a DELETE, even when the row itself is
// byte-identical across snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::records::{BusinessKey, SyncAction, Table, TableRecord};
use crate::snapshot::Snapshot;

// ============================================================================
// DELETED FUND SET
// ============================================================================

/// DeletedFundSet - fund codes removed from the master table this run
///
/// Insert-only. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct DeletedFundSet {
    codes: Arc<RwLock<BTreeSet<String>>>,
}

impl DeletedFundSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the code was not already present.
    pub fn insert(&self, fund_code: &str) -> bool {
        self.codes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fund_code.to_string())
    }

    pub fn contains(&self, fund_code: &str) -> bool {
        self.codes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fund_code)
    }

    pub fn len(&self) -> usize {
        self.codes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the set
    pub fn to_set(&self) -> BTreeSet<String> {
        self.codes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// ============================================================================
// CHANGESET
// ============================================================================

/// ChangeRow - one tagged row of a changeset
///
/// For DELETE, `record` is the row being removed (only its key matters).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow<R> {
    pub action: SyncAction,
    pub key: BusinessKey,
    pub record: R,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Changeset<R> {
    pub table: Table,
    /// Sorted by key, at most one row per key
    pub rows: Vec<ChangeRow<R>>,
}

impl<R> Changeset<R> {
    pub fn adds(&self) -> impl Iterator<Item = &ChangeRow<R>> {
        self.rows.iter().filter(|c| c.action == SyncAction::Add)
    }

    pub fn deletes(&self) -> impl Iterator<Item = &ChangeRow<R>> {
        self.rows.iter().filter(|c| c.action == SyncAction::Delete)
    }

    pub fn add_count(&self) -> usize {
        self.adds().count()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

// ============================================================================
// DIFF ENGINE
// ============================================================================

/// DiffEngine - computes changesets and owns the run's DeletedFundSet
///
/// Diff the master table before any dependent table.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    deleted_funds: DeletedFundSet,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deleted_funds(deleted_funds: DeletedFundSet) -> Self {
        DiffEngine { deleted_funds }
    }

    pub fn deleted_funds(&self) -> &DeletedFundSet {
        &self.deleted_funds
    }

    pub fn diff<R: TableRecord>(&self, old: &Snapshot<R>, new: &Snapshot<R>) -> Changeset<R> {
        let mut changes: BTreeMap<BusinessKey, ChangeRow<R>> = BTreeMap::new();

        for (key, record) in new.iter() {
            let changed = match old.get(key) {
                None => true,
                Some(previous) => previous.fingerprint() != record.fingerprint(),
            };
            if changed {
                changes.insert(key.clone(), change(SyncAction::Add, key, record));
            }
        }

        for (key, record) in old.iter() {
            if !new.contains_key(key) {
                changes.insert(key.clone(), change(SyncAction::Delete, key, record));
            }
        }

        if R::TABLE.is_master() {
            for row in changes.values().filter(|c| c.action == SyncAction::Delete) {
                if self.deleted_funds.insert(row.record.fund_code()) {
                    debug!(fund_code = %row.record.fund_code(), "fund removed from master");
                }
            }
        } else {
            let cascaded = self.cascade(&mut changes, old, new);
            if cascaded > 0 {
                info!("{}: {} rows deleted by cascade", R::TABLE, cascaded);
            }
        }

        let changeset = Changeset {
            table: R::TABLE,
            rows: changes.into_values().collect(),
        };
        info!(
            "🔀 {}: {} ADD, {} DELETE",
            R::TABLE,
            changeset.add_count(),
            changeset.delete_count()
        );
        changeset
    }

    /// Force DELETE for every row of a deleted fund. Returns rows affected.
    fn cascade<R: TableRecord>(
        &self,
        changes: &mut BTreeMap<BusinessKey, ChangeRow<R>>,
        old: &Snapshot<R>,
        new: &Snapshot<R>,
    ) -> usize {
        let deleted = self.deleted_funds.to_set();
        if deleted.is_empty() {
            return 0;
        }

        let mut cascaded = 0;
        for (key, record) in old.iter().chain(new.iter()) {
            if !deleted.contains(record.fund_code()) {
                continue;
            }
            let already_deleted = changes
                .get(key)
                .map_or(false, |c| c.action == SyncAction::Delete);
            if !already_deleted {
                changes.insert(key.clone(), change(SyncAction::Delete, key, record));
                cascaded += 1;
            }
        }
        cascaded
    }
}

fn change<R: Clone>(action: SyncAction, key: &BusinessKey, record: &R) -> ChangeRow<R> {
    ChangeRow {
        action,
        key: key.clone(),
        record: record.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DailyNavRecord, FundRecord, FundStatus, HoldingRecord, Source};
    use chrono::NaiveDate;

    fn create_test_fund(code: &str) -> FundRecord {
        FundRecord {
            fund_code: code.to_string(),
            full_name_th: None,
            full_name_en: Some(format!("{} Fund", code)),
            amc: Some("KAsset".to_string()),
            category: None,
            risk_level: None,
            is_dividend: None,
            inception_date: None,
            status: FundStatus::Active,
            source: Source::Finnomena,
            as_of: NaiveDate::from_ymd_opt(2024, 5, 1),
        }
    }

    fn create_test_holding(code: &str, name: &str, percent: f64) -> HoldingRecord {
        HoldingRecord {
            fund_code: code.to_string(),
            name: name.to_string(),
            source: Source::Finnomena,
            symbol: None,
            holding_type: Some("Equity".to_string()),
            sector: None,
            percent: Some(percent),
            as_of: NaiveDate::from_ymd_opt(2024, 4, 30),
        }
    }

    fn funds(codes: &[&str]) -> Snapshot<FundRecord> {
        Snapshot::from_rows("test", codes.iter().map(|c| create_test_fund(c)))
    }

    fn create_test_nav(value: f64, scraped_hour: u32) -> DailyNavRecord {
        DailyNavRecord {
            fund_code: "K-USA-A".to_string(),
            nav_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            nav_value: Some(value),
            aum: None,
            bid: None,
            offer: None,
            source: Source::Finnomena,
            scraped_at: NaiveDate::from_ymd_opt(2024, 5, 2)
                .unwrap()
                .and_hms_opt(scraped_hour, 0, 0),
        }
    }

    #[test]
    fn test_rescraped_nav_with_same_values_is_unchanged() {
        let engine = DiffEngine::new();
        let old = Snapshot::from_rows("old", [create_test_nav(10.0, 9)]);
        let new = Snapshot::from_rows("new", [create_test_nav(10.0, 10)]);
        assert!(engine.diff(&old, &new).is_empty());

        let moved = Snapshot::from_rows("new", [create_test_nav(10.2, 10)]);
        assert_eq!(engine.diff(&old, &moved).add_count(), 1);
    }

    #[test]
    fn test_identical_snapshots_produce_no_changes() {
        let engine = DiffEngine::new();
        let snapshot = funds(&["K-USA-A", "SCBSET"]);
        assert!(engine.diff(&snapshot, &snapshot).is_empty());
        assert!(engine.deleted_funds().is_empty());
    }

    #[test]
    fn test_added_removed_and_changed_keys() {
        let engine = DiffEngine::new();
        let old = funds(&["K-USA-A", "SCBSET", "GONE"]);
        let mut new = funds(&["K-USA-A", "SCBSET", "NEWFUND"]);
        let mut changed = create_test_fund("SCBSET");
        changed.amc = Some("SCBAM".to_string());
        new.insert(changed);

        let changeset = engine.diff(&old, &new);
        let actions: Vec<(String, SyncAction)> = changeset
            .rows
            .iter()
            .map(|c| (c.key.to_string(), c.action))
            .collect();

        assert_eq!(
            actions,
            vec![
                ("GONE".to_string(), SyncAction::Delete),
                ("NEWFUND".to_string(), SyncAction::Add),
                ("SCBSET".to_string(), SyncAction::Add),
            ]
        );
        assert!(engine.deleted_funds().contains("GONE"));
    }

    #[test]
    fn test_cascade_deletes_identical_dependent_rows() {
        let engine = DiffEngine::new();
        engine.diff(&funds(&["KEEP", "GONE"]), &funds(&["KEEP"]));

        // Byte-identical in both snapshots, yet the fund is gone
        let holdings = Snapshot::from_rows(
            "test",
            vec![
                create_test_holding("GONE", "Apple Inc", 7.5),
                create_test_holding("KEEP", "Apple Inc", 7.5),
            ],
        );
        let changeset = engine.diff(&holdings, &holdings);

        assert_eq!(changeset.len(), 1);
        assert_eq!(changeset.rows[0].action, SyncAction::Delete);
        assert_eq!(changeset.rows[0].key.fund_code(), "GONE");
        println!("✅ Cascade delete test PASSED");
    }

    #[test]
    fn test_cascade_overrides_add() {
        let engine = DiffEngine::new();
        engine.diff(&funds(&["GONE"]), &funds(&[]));

        let old = Snapshot::from_rows("old", vec![create_test_holding("GONE", "Apple Inc", 7.5)]);
        let new = Snapshot::from_rows(
            "new",
            vec![
                create_test_holding("GONE", "Apple Inc", 8.0),
                create_test_holding("GONE", "Microsoft", 5.0),
            ],
        );
        let changeset = engine.diff(&old, &new);

        assert_eq!(changeset.add_count(), 0);
        assert_eq!(changeset.delete_count(), 2);
    }

    #[test]
    fn test_rediff_after_apply_is_empty() {
        let engine = DiffEngine::new();
        let old = funds(&["A", "B"]);
        let new = funds(&["B", "C"]);
        assert_eq!(engine.diff(&old, &new).len(), 2);

        // The new snapshot becomes the baseline
        assert!(engine.diff(&new, &new).is_empty());
    }

    #[test]
    fn test_deleted_set_is_shared_between_clones() {
        let set = DeletedFundSet::new();
        let engine = DiffEngine::with_deleted_funds(set.clone());
        engine.diff(&funds(&["GONE"]), &funds(&[]));
        assert!(set.contains("GONE"));
        assert!(!set.insert("GONE"));
        assert_eq!(set.len(), 1);
    }
}
