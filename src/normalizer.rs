// 🧹 Normalizer - raw key→string rows into typed records
//
// A bad date or number never drops a row: the field becomes null and the
// failure is counted in a ParseReport. Rows are only dropped when their
// business key itself cannot be built.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::records::{
    AllocationRecord, CodeRecord, DailyNavRecord, FeeRecord, FundRecord, FundStatus,
    HoldingRecord, Source, StatisticsRecord, TableRecord,
};

// ============================================================================
// RAW ROW
// ============================================================================

/// RawRow - one flat row exactly as a crawler wrote it
///
/// Header names are trimmed, lowercased and stripped of a UTF-8 BOM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    fields: HashMap<String, String>,
}

impl RawRow {
    pub fn from_csv(headers: &csv::StringRecord, record: &csv::StringRecord) -> Self {
        headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h, v.to_string()))
            .collect()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.fields.insert(normalize_header(name), value.into());
    }

    /// Trimmed, non-empty value of a column
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// First non-empty value among column aliases
    pub fn first(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.get(name))
    }

    pub fn text(&self, names: &[&str]) -> Option<String> {
        self.first(names).map(str::to_string)
    }

    /// Tag the row with the source it was fetched from, unless it already says
    pub fn with_source(mut self, source: Source) -> Self {
        if self.get("source").is_none() {
            self.insert("source", source.code());
        }
        self
    }

    pub fn fund_code(&self) -> Option<&str> {
        self.get("fund_code")
    }

    fn date(&self, names: &[&str], report: &mut ParseReport) -> Option<NaiveDate> {
        let raw = self.first(names)?;
        match parse_date(raw) {
            Ok(date) => date,
            Err(err) => {
                report.null_field(names[0], err);
                None
            }
        }
    }

    fn number(&self, names: &[&str], report: &mut ParseReport) -> Option<f64> {
        let raw = self.first(names)?;
        match parse_numeric(raw) {
            Ok(value) => value,
            Err(err) => {
                report.null_field(names[0], err);
                None
            }
        }
    }

    fn timestamp(&self, names: &[&str], report: &mut ParseReport) -> Option<NaiveDateTime> {
        let raw = self.first(names)?;
        match parse_timestamp(raw) {
            Ok(value) => value,
            Err(err) => {
                report.null_field(names[0], err);
                None
            }
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = RawRow::default();
        for (k, v) in iter {
            row.insert(k.as_ref(), v);
        }
        row
    }
}

fn normalize_header(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}

// ============================================================================
// PARSE REPORT
// ============================================================================

/// Counters for everything the normalizer absorbed instead of failing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseReport {
    /// Fields set to null because their value could not be parsed
    pub nulled_fields: usize,
    /// Rows dropped because their business key was missing or unparsable
    pub dropped_rows: usize,
}

impl ParseReport {
    fn null_field(&mut self, column: &str, err: SyncError) {
        debug!("{}: {} (set to null)", column, err);
        self.nulled_fields += 1;
    }

    fn drop_row(&mut self, reason: &str) {
        debug!("dropping row: {}", reason);
        self.dropped_rows += 1;
    }
}

// ============================================================================
// FIELD PARSERS
// ============================================================================

const NULL_MARKERS: &[&str] = &["", "-", "--", "n/a", "na", "nan", "null", "none", "ไม่มี"];

const DATE_PREFIXES: &[&str] = &["ข้อมูล ณ วันที่", "ข้อมูลณวันที่", "ณ วันที่", "วันที่", "as of"];

const THAI_MONTHS: &[(&str, u32)] = &[
    ("ม.ค.", 1), ("ม.ค", 1), ("มกราคม", 1),
    ("ก.พ.", 2), ("ก.พ", 2), ("กุมภาพันธ์", 2),
    ("มี.ค.", 3), ("มี.ค", 3), ("มีนาคม", 3),
    ("เม.ย.", 4), ("เม.ย", 4), ("เมษายน", 4),
    ("พ.ค.", 5), ("พ.ค", 5), ("พฤษภาคม", 5),
    ("มิ.ย.", 6), ("มิ.ย", 6), ("มิถุนายน", 6),
    ("ก.ค.", 7), ("ก.ค", 7), ("กรกฎาคม", 7),
    ("ส.ค.", 8), ("ส.ค", 8), ("สิงหาคม", 8),
    ("ก.ย.", 9), ("ก.ย", 9), ("กันยายน", 9),
    ("ต.ค.", 10), ("ต.ค", 10), ("ตุลาคม", 10),
    ("พ.ย.", 11), ("พ.ย", 11), ("พฤศจิกายน", 11),
    ("ธ.ค.", 12), ("ธ.ค", 12), ("ธันวาคม", 12),
];

fn is_null_marker(value: &str) -> bool {
    let lower = value.trim().to_lowercase();
    NULL_MARKERS.contains(&lower.as_str()) || lower.contains("n/a")
}

/// Buddhist-era years are detected by magnitude
fn to_gregorian_year(year: i32) -> i32 {
    if year < 100 {
        2500 + year - 543
    } else if year > 2400 {
        year - 543
    } else {
        year
    }
}

fn build_date(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let year: i32 = year.trim().parse().ok()?;
    let month: u32 = month.trim().parse().ok()?;
    let day: u32 = day.trim().parse().ok()?;
    NaiveDate::from_ymd_opt(to_gregorian_year(year), month, day)
}

fn strip_date_prefix(value: &str) -> &str {
    let mut text = value.trim();
    for prefix in DATE_PREFIXES {
        if text.len() >= prefix.len()
            && text.is_char_boundary(prefix.len())
            && text[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            text = text[prefix.len()..].trim_start_matches(':').trim();
        }
    }
    text
}

/// yyyymmdd
fn parse_compact(text: &str) -> Option<NaiveDate> {
    if text.len() != 8 || !text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    build_date(&text[0..4], &text[4..6], &text[6..8])
}

/// yyyy-mm-dd, optionally followed by a time part
fn parse_year_first(text: &str) -> Option<NaiveDate> {
    let date_part = text.split(|c: char| c == 'T' || c == ' ').next()?;
    let parts: Vec<&str> = date_part.split(|c: char| c == '-' || c == '/').collect();
    if parts.len() != 3 || parts[0].len() != 4 {
        return None;
    }
    build_date(parts[0], parts[1], parts[2])
}

/// dd/mm/yyyy, dd-mm-yyyy, d/m/yy
fn parse_day_first(text: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = text.split(|c: char| c == '-' || c == '/').collect();
    if parts.len() != 3 || parts[0].is_empty() || parts[0].len() > 2 {
        return None;
    }
    build_date(parts[2], parts[1], parts[0])
}

/// 15 ม.ค. 2567
fn parse_thai_month(text: &str) -> Option<NaiveDate> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() != 3 {
        return None;
    }
    let month = THAI_MONTHS
        .iter()
        .find(|(name, _)| *name == tokens[1])
        .map(|(_, m)| *m)?;
    build_date(tokens[2], &month.to_string(), tokens[0])
}

/// Parse any of the date shapes the crawlers emit into one canonical date.
///
/// `Ok(None)` for null markers, `Err(Parse)` for shapes nobody recognizes.
pub fn parse_date(raw: &str) -> Result<Option<NaiveDate>> {
    let text = strip_date_prefix(raw);
    if is_null_marker(text) {
        return Ok(None);
    }

    parse_compact(text)
        .or_else(|| parse_year_first(text))
        .or_else(|| parse_day_first(text))
        .or_else(|| parse_thai_month(text))
        .map(Some)
        .ok_or_else(|| SyncError::Parse {
            field: "date".to_string(),
            value: raw.to_string(),
        })
}

/// Parse a locale-formatted number: thousands separators and percent signs
/// are stripped, null markers map to None.
pub fn parse_numeric(raw: &str) -> Result<Option<f64>> {
    let text = raw.trim();
    if is_null_marker(text) {
        return Ok(None);
    }

    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '%') && !c.is_whitespace())
        .collect();
    let cleaned = cleaned.trim_start_matches('+');

    if let Ok(value) = cleaned.parse::<f64>() {
        if value.is_finite() {
            return Ok(Some(value));
        }
    }

    // "1.50 ต่อปี" and friends: keep the leading number
    leading_number(cleaned)
        .map(Some)
        .ok_or_else(|| SyncError::Parse {
            field: "number".to_string(),
            value: raw.to_string(),
        })
}

fn leading_number(text: &str) -> Option<f64> {
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    for (i, c) in text.char_indices() {
        match c {
            '-' if i == 0 => {}
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end = i + c.len_utf8();
    }
    if !seen_digit {
        return None;
    }
    text[..end].trim_end_matches('.').parse().ok()
}

/// Parse a scrape timestamp; a bare date means midnight.
pub fn parse_timestamp(raw: &str) -> Result<Option<NaiveDateTime>> {
    let text = raw.trim();
    if is_null_marker(text) {
        return Ok(None);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(Some(ts.naive_local()));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Some(ts));
        }
    }
    match parse_date(text) {
        Ok(Some(date)) => Ok(date.and_hms_opt(0, 0, 0)),
        _ => Err(SyncError::Parse {
            field: "timestamp".to_string(),
            value: raw.to_string(),
        }),
    }
}

// ============================================================================
// TYPED CONSTRUCTION
// ============================================================================

/// FromRaw - build one typed record from a raw row
///
/// Returns None (and counts a dropped row) only when the business key
/// cannot be built.
pub trait FromRaw: Sized {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self>;
}

fn key_text(row: &RawRow, names: &[&str], report: &mut ParseReport) -> Option<String> {
    match row.text(names) {
        Some(value) => Some(value),
        None => {
            report.drop_row(&format!("missing {}", names[0]));
            None
        }
    }
}

fn row_source(row: &RawRow, report: &mut ParseReport) -> Option<Source> {
    match row.get("source").and_then(Source::parse) {
        Some(source) => Some(source),
        None => {
            report.drop_row("missing or unknown source");
            None
        }
    }
}

impl FromRaw for FundRecord {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self> {
        let fund_code = key_text(row, &["fund_code"], report)?;
        let source = row_source(row, report)?;
        Some(FundRecord {
            fund_code,
            full_name_th: row.text(&["full_name_th", "name_th"]),
            full_name_en: row.text(&["full_name_en", "name_en", "name"]),
            amc: row.text(&["amc"]),
            category: row.text(&["category"]),
            risk_level: row.text(&["risk_level", "risk"]),
            is_dividend: row.text(&["is_dividend", "dividend_policy"]),
            inception_date: row.date(&["inception_date"], report),
            status: row
                .first(&["fund_status", "status"])
                .map(FundStatus::parse)
                .unwrap_or(FundStatus::Active),
            source,
            as_of: row.date(&["as_of", "as_of_date", "data_date"], report),
        })
    }
}

impl FromRaw for FeeRecord {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self> {
        let fund_code = key_text(row, &["fund_code"], report)?;
        let source = row_source(row, report)?;
        Some(FeeRecord {
            fund_code,
            front_end_max: row.number(&["front_end_max"], report),
            front_end_actual: row.number(&["front_end_actual"], report),
            back_end_max: row.number(&["back_end_max"], report),
            back_end_actual: row.number(&["back_end_actual"], report),
            management_max: row.number(&["management_max"], report),
            management_actual: row.number(&["management_actual"], report),
            ter_max: row.number(&["ter_max"], report),
            ter_actual: row.number(&["ter_actual"], report),
            switching_in_max: row.number(&["switching_in_max"], report),
            switching_in_actual: row.number(&["switching_in_actual"], report),
            switching_out_max: row.number(&["switching_out_max"], report),
            switching_out_actual: row.number(&["switching_out_actual"], report),
            min_initial_buy: row.number(&["min_initial_buy"], report),
            min_next_buy: row.number(&["min_next_buy"], report),
            source,
            as_of: row.date(&["as_of", "as_of_date"], report),
        })
    }
}

impl FromRaw for HoldingRecord {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self> {
        let fund_code = key_text(row, &["fund_code"], report)?;
        let name = key_text(row, &["name", "holding_name"], report)?;
        let source = row_source(row, report)?;
        Some(HoldingRecord {
            fund_code,
            name,
            source,
            symbol: row.text(&["symbol"]),
            holding_type: row.text(&["holding_type"]),
            sector: row.text(&["sector"]),
            percent: row.number(&["percent", "weight_pct"], report),
            as_of: row.date(&["as_of", "as_of_date", "as_of_raw"], report),
        })
    }
}

impl FromRaw for AllocationRecord {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self> {
        let fund_code = key_text(row, &["fund_code"], report)?;
        let name = key_text(row, &["name"], report)?;
        let alloc_type = key_text(row, &["alloc_type", "type"], report)?;
        let source = row_source(row, report)?;
        Some(AllocationRecord {
            fund_code,
            name,
            alloc_type,
            source,
            percent: row.number(&["percent"], report),
            as_of: row.date(&["as_of", "as_of_date"], report),
        })
    }
}

impl FromRaw for DailyNavRecord {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self> {
        let fund_code = key_text(row, &["fund_code"], report)?;
        let nav_date = match row.date(&["nav_date", "date"], report) {
            Some(date) => date,
            None => {
                report.drop_row("missing or unparsable nav_date");
                return None;
            }
        };
        let source = row_source(row, report)?;
        Some(DailyNavRecord {
            fund_code,
            nav_date,
            nav_value: row.number(&["nav_value", "value", "nav"], report),
            aum: row.number(&["aum", "amount"], report),
            bid: row.number(&["bid", "bid_price", "bid_price_per_unit"], report),
            offer: row.number(&["offer", "offer_price", "offer_price_per_unit"], report),
            source,
            scraped_at: row.timestamp(&["scraped_at"], report),
        })
    }
}

impl FromRaw for CodeRecord {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self> {
        let fund_code = key_text(row, &["fund_code"], report)?;
        let code = key_text(row, &["code", "isin"], report)?;
        let source = row_source(row, report)?;
        Some(CodeRecord {
            fund_code,
            code,
            code_type: row.text(&["code_type", "type"]),
            source,
        })
    }
}

impl FromRaw for StatisticsRecord {
    fn from_raw(row: &RawRow, report: &mut ParseReport) -> Option<Self> {
        let fund_code = key_text(row, &["fund_code"], report)?;
        let source = row_source(row, report)?;
        Some(StatisticsRecord {
            fund_code,
            sharpe_ratio: row.number(&["sharpe_ratio"], report),
            alpha: row.number(&["alpha"], report),
            beta: row.number(&["beta"], report),
            max_drawdown: row.number(&["max_drawdown"], report),
            recovering_period_days: row
                .number(&["recovering_period_days", "recovering_period"], report)
                .map(|days| days.round() as i64),
            tracking_error: row.number(&["tracking_error"], report),
            turnover_ratio: row.number(&["turnover_ratio"], report),
            fx_hedging: row.number(&["fx_hedging"], report),
            source,
            as_of: row.date(&["as_of", "as_of_date"], report),
        })
    }
}

/// Normalize a batch of raw rows for one table
pub fn normalize_rows<R: TableRecord>(rows: &[RawRow], report: &mut ParseReport) -> Vec<R> {
    rows.iter()
        .filter_map(|row| R::from_raw(row, report))
        .collect()
}

// ============================================================================
// HOLDING TYPES
// ============================================================================

const OTHER_KEYWORDS: &[&str] = &[
    "OTHER", "อื่นๆ", "CASH", "DEPOSIT", "SAVING", "เงินฝาก", "INTEREST", "ACCRUED", "REPO",
    "MARGIN",
];
const CURRENCY_CODES: &[&str] = &["THB", "USD", "EUR", "JPY", "CNY", "SGD"];
const BOND_KEYWORDS: &[&str] = &[
    "BANK OF THAILAND", "BOT BOND", "TREASURY", "GOV BOND", "GOVERNMENT BOND", "DEBENTURE",
    "BILL OF EXCHANGE", "T-BILL", "พันธบัตร", "หุ้นกู้", "LOAN STOCK", "DEB", "NOTES", "STRIPS",
    "FIXED INCOME", "SOVEREIGN",
];
const FUND_KEYWORDS: &[&str] = &[
    "FUND", "REIT", "INFRASTRUCTURE", "กองทุน", "ETF", "UNIT TRUST", "SICAV", "UCITS", "TRUST",
    "REAL ESTATE INVESTMENT",
];
const FUND_CLASS_SUFFIXES: &[&str] = &["-A", "-D", "-E", "-P", "-R", "-SSF", "-RMF"];

/// Holding code from a display name: `"Apple Inc (AAPL)"` -> `"AAPL"`,
/// otherwise the trimmed name itself.
pub fn holding_code(name: &str) -> &str {
    let name = name.trim();
    name.strip_suffix(')')
        .and_then(|rest| rest.rfind('(').map(|open| rest[open + 1..].trim()))
        .filter(|code| !code.is_empty() && !code.contains(|c| c == '(' || c == ')'))
        .unwrap_or(name)
}

/// Keyword rules for a holding's asset class.
///
/// Order matters: cash-like wins over bond, bond over fund. `None` means
/// the rules cannot tell (typically a listed stock) and a lookup entry is
/// needed.
pub fn classify_holding(name: &str, code: &str) -> Option<&'static str> {
    let name = name.to_uppercase();
    let code = code.to_uppercase();
    let name_has = |keywords: &[&str]| keywords.iter().any(|k| name.contains(k));

    if name_has(OTHER_KEYWORDS) || CURRENCY_CODES.contains(&code.as_str()) {
        return Some("Other");
    }
    if name_has(BOND_KEYWORDS) {
        return Some("Bond");
    }
    // Thai bond series codes: long, at least two digits, e.g. LB31DA
    let digits = code.chars().filter(char::is_ascii_digit).count();
    if code.chars().count() >= 6 && digits >= 2 && !name_has(&["FUND", "REIT", "ETF"]) {
        return Some("Bond");
    }
    if name_has(FUND_KEYWORDS) || FUND_CLASS_SUFFIXES.iter().any(|s| code.ends_with(s)) {
        return Some("Fund");
    }
    None
}

/// What the lookup knows about one holding code
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingType {
    pub holding_type: String,
    pub sector: Option<String>,
    /// Listing symbol, only meaningful for stocks
    pub symbol: Option<String>,
}

/// HoldingTypeCache - holding code -> type, shared by all workers
///
/// Seeded from a lookup CSV (`holding_code,type,sector,symbol`). Codes the
/// keyword rules resolve are memoized so each distinct code is classified
/// once per run.
#[derive(Debug, Default)]
pub struct HoldingTypeCache {
    entries: RwLock<HashMap<String, HoldingType>>,
}

impl HoldingTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the lookup file; a missing file gives an empty cache.
    pub fn load_csv(path: &Path) -> Result<Self> {
        let cache = Self::new();
        if !path.exists() {
            debug!("No holding type lookup at {:?}", path);
            return Ok(cache);
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        for record in reader.records() {
            let row = RawRow::from_csv(&headers, &record?);
            let (Some(code), Some(kind)) = (row.get("holding_code"), row.first(&["type", "holding_type"]))
            else {
                continue;
            };
            cache.insert(
                code,
                HoldingType {
                    holding_type: kind.to_string(),
                    sector: row.text(&["sector"]).filter(|s| s != "-"),
                    symbol: row.text(&["symbol"]),
                },
            );
        }
        info!("🏷️  Loaded {} holding types from {:?}", cache.len(), path);
        Ok(cache)
    }

    pub fn insert(&self, code: &str, entry: HoldingType) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.trim().to_uppercase(), entry);
    }

    pub fn get(&self, code: &str) -> Option<HoldingType> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&code.trim().to_uppercase())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup first, keyword rules second.
    pub fn resolve(&self, name: &str) -> Option<HoldingType> {
        let code = holding_code(name);
        if let Some(known) = self.get(code) {
            return Some(known);
        }
        let entry = HoldingType {
            holding_type: classify_holding(name, code)?.to_string(),
            sector: None,
            symbol: None,
        };
        self.insert(code, entry.clone());
        Some(entry)
    }

    /// Type every holding that arrived without one. Sector and symbol are
    /// only filled when the row has none. Returns the number typed.
    pub fn fill(&self, holdings: &mut [HoldingRecord]) -> usize {
        let mut typed = 0;
        for holding in holdings.iter_mut().filter(|h| h.holding_type.is_none()) {
            let Some(entry) = self.resolve(&holding.name) else {
                continue;
            };
            let is_stock = entry.holding_type.starts_with("Stock");
            holding.holding_type = Some(entry.holding_type);
            if holding.sector.is_none() {
                holding.sector = entry.sector;
            }
            if holding.symbol.is_none() && is_stock {
                holding.symbol = entry.symbol;
            }
            typed += 1;
        }
        typed
    }
}

// ============================================================================
// ORPHAN FILTERING
// ============================================================================

/// Drop dependent rows whose fund_code is not in the master key set.
///
/// Returns the kept rows and the number dropped. The master table is
/// returned untouched.
pub fn filter_orphans<R: TableRecord>(rows: Vec<R>, fund_keys: &HashSet<String>) -> (Vec<R>, usize) {
    if R::TABLE.is_master() {
        return (rows, 0);
    }

    let before = rows.len();
    let kept: Vec<R> = rows
        .into_iter()
        .filter(|row| {
            let known = fund_keys.contains(row.fund_code());
            if !known {
                let err = SyncError::OrphanReference {
                    table: R::TABLE,
                    fund_code: row.fund_code().to_string(),
                };
                debug!("{}", err);
            }
            known
        })
        .collect();

    let dropped = before - kept.len();
    if dropped > 0 {
        warn!("{}: dropped {} orphan rows (fund_code not in master snapshot)", R::TABLE, dropped);
    }
    (kept, dropped)
}

// ============================================================================
// TESTS
// ============================================================================
