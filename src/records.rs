// 🗂️ Record Model - one typed struct per table
//
// Every row carries its source tag and an as_of / scraped_at time.
// Business keys are unique within one snapshot; non-master rows reference
// a FundRecord through fund_code.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::normalizer::FromRaw;

/// Canonical timestamp layout used in snapshot files
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

// ============================================================================
// SOURCE
// ============================================================================

/// Source - which crawler produced a row
///
/// Declaration order is the fixed tie-break ordering used by arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Finnomena,
    #[serde(rename = "wealthmagik")]
    WealthMagik,
    /// Regulator feed
    Sec,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Finnomena, Source::WealthMagik, Source::Sec];

    /// Short code used in files and the datastore
    pub fn code(&self) -> &'static str {
        match self {
            Source::Finnomena => "finnomena",
            Source::WealthMagik => "wealthmagik",
            Source::Sec => "sec",
        }
    }

    pub fn parse(value: &str) -> Option<Source> {
        match value.trim().to_lowercase().as_str() {
            "finnomena" | "fn" => Some(Source::Finnomena),
            "wealthmagik" | "wm" => Some(Source::WealthMagik),
            "sec" => Some(Source::Sec),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// STATUS + SYNC ACTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FundStatus {
    Active,
    Inactive,
}

impl FundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundStatus::Active => "active",
            FundStatus::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> FundStatus {
        if value.trim().eq_ignore_ascii_case("inactive") {
            FundStatus::Inactive
        } else {
            FundStatus::Active
        }
    }
}

/// Tag of one changeset row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAction {
    Add,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Add => "ADD",
            SyncAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TABLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Funds,
    Fees,
    Holdings,
    Allocations,
    DailyNav,
    Codes,
    Statistics,
}

impl Table {
    /// Master first; dependents in apply order
    pub const ALL: [Table; 7] = [
        Table::Funds,
        Table::Fees,
        Table::Holdings,
        Table::Allocations,
        Table::DailyNav,
        Table::Codes,
        Table::Statistics,
    ];

    /// File stem for raw, work, merged and baseline CSVs
    pub fn name(&self) -> &'static str {
        match self {
            Table::Funds => "funds",
            Table::Fees => "fees",
            Table::Holdings => "holdings",
            Table::Allocations => "allocations",
            Table::DailyNav => "daily_nav",
            Table::Codes => "codes",
            Table::Statistics => "statistics",
        }
    }

    pub fn sql_table(&self) -> &'static str {
        match self {
            Table::Funds => "funds_master_info",
            Table::Fees => "funds_fee",
            Table::Holdings => "funds_holding",
            Table::Allocations => "funds_allocations",
            Table::DailyNav => "funds_daily",
            Table::Codes => "funds_codes",
            Table::Statistics => "funds_statistics",
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Table::Funds)
    }

    pub fn file_name(&self) -> String {
        format!("{}.csv", self.name())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// BUSINESS KEY
// ============================================================================

/// BusinessKey - natural identifier, parts aligned with KEY_COLUMNS
///
/// The first part is always the fund_code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessKey(Vec<String>);

impl BusinessKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BusinessKey(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn fund_code(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

// ============================================================================
// TABLE RECORD TRAIT
// ============================================================================

/// TableRecord - what every per-table row type provides to the engine
///
/// `fields()` renders the canonical CSV form, aligned with `COLUMNS`;
/// an empty string is null.
pub trait TableRecord: FromRaw + Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    const TABLE: Table;
    const COLUMNS: &'static [&'static str];
    const KEY_COLUMNS: &'static [&'static str];

    fn fund_code(&self) -> &str;
    fn source(&self) -> Source;
    fn business_key(&self) -> BusinessKey;
    fn fields(&self) -> Vec<String>;

    /// Freshness date used by whole-entity arbitration
    fn as_of(&self) -> Option<NaiveDate> {
        None
    }

    /// Fields that count as content for change detection. Scrape metadata
    /// is left out so a re-scrape of the same values is not a change.
    fn content_fields(&self) -> Vec<String> {
        self.fields()
    }

    /// Content hash over `content_fields()`
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content_fields().join("\u{1f}"));
        format!("{:x}", hasher.finalize())
    }
}

// Rendering helpers shared by the fields() implementations

pub(crate) fn opt_text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

pub(crate) fn opt_num(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub(crate) fn opt_int(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub(crate) fn opt_date(value: Option<NaiveDate>) -> String {
    value
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

pub(crate) fn opt_timestamp(value: Option<NaiveDateTime>) -> String {
    value
        .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default()
}

// ============================================================================
// FUND (MASTER)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundRecord {
    pub fund_code: String,
    pub full_name_th: Option<String>,
    pub full_name_en: Option<String>,
    pub amc: Option<String>,
    pub category: Option<String>,
    pub risk_level: Option<String>,
    pub is_dividend: Option<String>,
    pub inception_date: Option<NaiveDate>,
    pub status: FundStatus,
    pub source: Source,
    pub as_of: Option<NaiveDate>,
}

impl TableRecord for FundRecord {
    const TABLE: Table = Table::Funds;
    const COLUMNS: &'static [&'static str] = &[
        "fund_code",
        "full_name_th",
        "full_name_en",
        "amc",
        "category",
        "risk_level",
        "is_dividend",
        "inception_date",
        "fund_status",
        "source",
        "as_of",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["fund_code"];

    fn fund_code(&self) -> &str {
        &self.fund_code
    }

    fn source(&self) -> Source {
        self.source
    }

    fn business_key(&self) -> BusinessKey {
        BusinessKey::new([self.fund_code.clone()])
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.fund_code.clone(),
            opt_text(&self.full_name_th),
            opt_text(&self.full_name_en),
            opt_text(&self.amc),
            opt_text(&self.category),
            opt_text(&self.risk_level),
            opt_text(&self.is_dividend),
            opt_date(self.inception_date),
            self.status.as_str().to_string(),
            self.source.code().to_string(),
            opt_date(self.as_of),
        ]
    }

    fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }
}

// ============================================================================
// FEE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeRecord {
    pub fund_code: String,
    pub front_end_max: Option<f64>,
    pub front_end_actual: Option<f64>,
    pub back_end_max: Option<f64>,
    pub back_end_actual: Option<f64>,
    pub management_max: Option<f64>,
    pub management_actual: Option<f64>,
    pub ter_max: Option<f64>,
    pub ter_actual: Option<f64>,
    pub switching_in_max: Option<f64>,
    pub switching_in_actual: Option<f64>,
    pub switching_out_max: Option<f64>,
    pub switching_out_actual: Option<f64>,
    pub min_initial_buy: Option<f64>,
    pub min_next_buy: Option<f64>,
    pub source: Source,
    pub as_of: Option<NaiveDate>,
}

impl TableRecord for FeeRecord {
    const TABLE: Table = Table::Fees;
    const COLUMNS: &'static [&'static str] = &[
        "fund_code",
        "front_end_max",
        "front_end_actual",
        "back_end_max",
        "back_end_actual",
        "management_max",
        "management_actual",
        "ter_max",
        "ter_actual",
        "switching_in_max",
        "switching_in_actual",
        "switching_out_max",
        "switching_out_actual",
        "min_initial_buy",
        "min_next_buy",
        "source",
        "as_of",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["fund_code"];

    fn fund_code(&self) -> &str {
        &self.fund_code
    }

    fn source(&self) -> Source {
        self.source
    }

    fn business_key(&self) -> BusinessKey {
        BusinessKey::new([self.fund_code.clone()])
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.fund_code.clone(),
            opt_num(self.front_end_max),
            opt_num(self.front_end_actual),
            opt_num(self.back_end_max),
            opt_num(self.back_end_actual),
            opt_num(self.management_max),
            opt_num(self.management_actual),
            opt_num(self.ter_max),
            opt_num(self.ter_actual),
            opt_num(self.switching_in_max),
            opt_num(self.switching_in_actual),
            opt_num(self.switching_out_max),
            opt_num(self.switching_out_actual),
            opt_num(self.min_initial_buy),
            opt_num(self.min_next_buy),
            self.source.code().to_string(),
            opt_date(self.as_of),
        ]
    }

    fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }
}

// ============================================================================
// HOLDING / ALLOCATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingRecord {
    pub fund_code: String,
    pub name: String,
    pub source: Source,
    pub symbol: Option<String>,
    pub holding_type: Option<String>,
    pub sector: Option<String>,
    pub percent: Option<f64>,
    pub as_of: Option<NaiveDate>,
}

impl TableRecord for HoldingRecord {
    const TABLE: Table = Table::Holdings;
    const COLUMNS: &'static [&'static str] = &[
        "fund_code",
        "name",
        "source",
        "symbol",
        "holding_type",
        "sector",
        "percent",
        "as_of",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["fund_code", "name", "source"];

    fn fund_code(&self) -> &str {
        &self.fund_code
    }

    fn source(&self) -> Source {
        self.source
    }

    fn business_key(&self) -> BusinessKey {
        BusinessKey::new([
            self.fund_code.clone(),
            self.name.clone(),
            self.source.code().to_string(),
        ])
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.fund_code.clone(),
            self.name.clone(),
            self.source.code().to_string(),
            opt_text(&self.symbol),
            opt_text(&self.holding_type),
            opt_text(&self.sector),
            opt_num(self.percent),
            opt_date(self.as_of),
        ]
    }

    fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub fund_code: String,
    pub name: String,
    pub alloc_type: String,
    pub source: Source,
    pub percent: Option<f64>,
    pub as_of: Option<NaiveDate>,
}

impl TableRecord for AllocationRecord {
    const TABLE: Table = Table::Allocations;
    const COLUMNS: &'static [&'static str] =
        &["fund_code", "name", "alloc_type", "source", "percent", "as_of"];
    const KEY_COLUMNS: &'static [&'static str] = &["fund_code", "name", "alloc_type", "source"];

    fn fund_code(&self) -> &str {
        &self.fund_code
    }

    fn source(&self) -> Source {
        self.source
    }

    fn business_key(&self) -> BusinessKey {
        BusinessKey::new([
            self.fund_code.clone(),
            self.name.clone(),
            self.alloc_type.clone(),
            self.source.code().to_string(),
        ])
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.fund_code.clone(),
            self.name.clone(),
            self.alloc_type.clone(),
            self.source.code().to_string(),
            opt_num(self.percent),
            opt_date(self.as_of),
        ]
    }

    fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }
}

// ============================================================================
// DAILY NAV
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyNavRecord {
    pub fund_code: String,
    pub nav_date: NaiveDate,
    pub nav_value: Option<f64>,
    pub aum: Option<f64>,
    pub bid: Option<f64>,
    pub offer: Option<f64>,
    pub source: Source,
    pub scraped_at: Option<NaiveDateTime>,
}

impl TableRecord for DailyNavRecord {
    const TABLE: Table = Table::DailyNav;
    const COLUMNS: &'static [&'static str] = &[
        "fund_code",
        "nav_date",
        "nav_value",
        "aum",
        "bid",
        "offer",
        "source",
        "scraped_at",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["fund_code", "nav_date"];

    fn fund_code(&self) -> &str {
        &self.fund_code
    }

    fn source(&self) -> Source {
        self.source
    }

    fn business_key(&self) -> BusinessKey {
        BusinessKey::new([self.fund_code.clone(), opt_date(Some(self.nav_date))])
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.fund_code.clone(),
            opt_date(Some(self.nav_date)),
            opt_num(self.nav_value),
            opt_num(self.aum),
            opt_num(self.bid),
            opt_num(self.offer),
            self.source.code().to_string(),
            opt_timestamp(self.scraped_at),
        ]
    }

    fn content_fields(&self) -> Vec<String> {
        let mut fields = self.fields();
        fields.pop(); // scraped_at
        fields
    }

    fn as_of(&self) -> Option<NaiveDate> {
        Some(self.nav_date)
    }
}

// ============================================================================
// CODE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub fund_code: String,
    pub code: String,
    /// isin, bloomberg, ...
    pub code_type: Option<String>,
    pub source: Source,
}

impl TableRecord for CodeRecord {
    const TABLE: Table = Table::Codes;
    const COLUMNS: &'static [&'static str] = &["fund_code", "code", "code_type", "source"];
    const KEY_COLUMNS: &'static [&'static str] = &["fund_code", "code"];

    fn fund_code(&self) -> &str {
        &self.fund_code
    }

    fn source(&self) -> Source {
        self.source
    }

    fn business_key(&self) -> BusinessKey {
        BusinessKey::new([self.fund_code.clone(), self.code.clone()])
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.fund_code.clone(),
            self.code.clone(),
            opt_text(&self.code_type),
            self.source.code().to_string(),
        ]
    }
}

// ============================================================================
// STATISTICS (regulator feed)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub fund_code: String,
    pub sharpe_ratio: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub recovering_period_days: Option<i64>,
    pub tracking_error: Option<f64>,
    pub turnover_ratio: Option<f64>,
    pub fx_hedging: Option<f64>,
    pub source: Source,
    pub as_of: Option<NaiveDate>,
}

impl TableRecord for StatisticsRecord {
    const TABLE: Table = Table::Statistics;
    const COLUMNS: &'static [&'static str] = &[
        "fund_code",
        "sharpe_ratio",
        "alpha",
        "beta",
        "max_drawdown",
        "recovering_period_days",
        "tracking_error",
        "turnover_ratio",
        "fx_hedging",
        "source",
        "as_of",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["fund_code"];

    fn fund_code(&self) -> &str {
        &self.fund_code
    }

    fn source(&self) -> Source {
        self.source
    }

    fn business_key(&self) -> BusinessKey {
        BusinessKey::new([self.fund_code.clone()])
    }

    fn fields(&self) -> Vec<String> {
        vec![
            self.fund_code.clone(),
            opt_num(self.sharpe_ratio),
            opt_num(self.alpha),
            opt_num(self.beta),
            opt_num(self.max_drawdown),
            opt_int(self.recovering_period_days),
            opt_num(self.tracking_error),
            opt_num(self.turnover_ratio),
            opt_num(self.fx_hedging),
            self.source.code().to_string(),
            opt_date(self.as_of),
        ]
    }

    fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }
}

// ============================================================================
// UNIT BUNDLE
// ============================================================================

/// UnitRecords - every table's rows for one fund (one unit of work)
///
/// Used both for the per-source candidates coming out of the normalizer and
/// for the canonical rows coming out of arbitration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitRecords {
    pub funds: Vec<FundRecord>,
    pub fees: Vec<FeeRecord>,
    pub holdings: Vec<HoldingRecord>,
    pub allocations: Vec<AllocationRecord>,
    pub navs: Vec<DailyNavRecord>,
    pub codes: Vec<CodeRecord>,
    pub statistics: Vec<StatisticsRecord>,
}

impl UnitRecords {
    pub fn row_count(&self) -> usize {
        self.funds.len()
            + self.fees.len()
            + self.holdings.len()
            + self.allocations.len()
            + self.navs.len()
            + self.codes.len()
            + self.statistics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn nav(value: f64) -> DailyNavRecord {
        DailyNavRecord {
            fund_code: "K-USA-A".to_string(),
            nav_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            nav_value: Some(value),
            aum: None,
            bid: None,
            offer: None,
            source: Source::Finnomena,
            scraped_at: None,
        }
    }

    #[test]
    fn test_source_ordering_is_fixed() {
        assert!(Source::Finnomena < Source::WealthMagik);
        assert!(Source::WealthMagik < Source::Sec);
        assert_eq!(Source::parse(" WealthMagik "), Some(Source::WealthMagik));
        assert_eq!(Source::parse("unknown"), None);
    }

    #[test]
    fn test_fields_align_with_columns() {
        let record = nav(10.0);
        assert_eq!(record.fields().len(), DailyNavRecord::COLUMNS.len());
        assert_eq!(record.fields()[1], "2024-05-01");
        assert_eq!(record.fields()[3], "", "null renders as empty string");
    }

    #[test]
    fn test_business_key_starts_with_fund_code() {
        let key = nav(10.0).business_key();
        assert_eq!(key.fund_code(), "K-USA-A");
        assert_eq!(key.to_string(), "K-USA-A|2024-05-01");
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        assert_eq!(nav(10.0).fingerprint(), nav(10.0).fingerprint());
        assert_ne!(nav(10.0).fingerprint(), nav(10.05).fingerprint());
        assert_eq!(nav(10.0).fingerprint().len(), 64);
    }
}
