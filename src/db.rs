// 🗄️ Datastore - schema setup and the Sync Applier
//
// One SQLite table per record table, primary key = business key.
// Dependents reference funds_master_info(fund_code), so the master
// changeset must be applied before any dependent changeset.
//
// Apply semantics per changeset row:
//   ADD    -> upsert (INSERT ... ON CONFLICT DO UPDATE); master rows forced active
//   DELETE -> master: soft delete (fund_status = 'inactive')
//             dependents: hard delete
// Each changeset runs in one transaction. Applying the same changeset twice
// leaves the same state.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

use crate::diff::Changeset;
use crate::error::{Result, SyncError};
use crate::records::{FundStatus, SyncAction, Table, TableRecord};

// ============================================================================
// SCHEMA
// ============================================================================

/// Open (or create) the datastore and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Master
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds_master_info (
            fund_code TEXT PRIMARY KEY NOT NULL,
            full_name_th TEXT,
            full_name_en TEXT,
            amc TEXT,
            category TEXT,
            risk_level TEXT,
            is_dividend TEXT,
            inception_date TEXT,
            fund_status TEXT NOT NULL DEFAULT 'active',
            source TEXT NOT NULL,
            as_of TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Dependents
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds_fee (
            fund_code TEXT PRIMARY KEY NOT NULL REFERENCES funds_master_info(fund_code),
            front_end_max REAL,
            front_end_actual REAL,
            back_end_max REAL,
            back_end_actual REAL,
            management_max REAL,
            management_actual REAL,
            ter_max REAL,
            ter_actual REAL,
            switching_in_max REAL,
            switching_in_actual REAL,
            switching_out_max REAL,
            switching_out_actual REAL,
            min_initial_buy REAL,
            min_next_buy REAL,
            source TEXT NOT NULL,
            as_of TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds_holding (
            fund_code TEXT NOT NULL REFERENCES funds_master_info(fund_code),
            name TEXT NOT NULL,
            source TEXT NOT NULL,
            symbol TEXT,
            holding_type TEXT,
            sector TEXT,
            percent REAL,
            as_of TEXT,
            PRIMARY KEY (fund_code, name, source)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds_allocations (
            fund_code TEXT NOT NULL REFERENCES funds_master_info(fund_code),
            name TEXT NOT NULL,
            alloc_type TEXT NOT NULL,
            source TEXT NOT NULL,
            percent REAL,
            as_of TEXT,
            PRIMARY KEY (fund_code, name, alloc_type, source)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds_daily (
            fund_code TEXT NOT NULL REFERENCES funds_master_info(fund_code),
            nav_date TEXT NOT NULL,
            nav_value REAL,
            aum REAL,
            bid REAL,
            offer REAL,
            source TEXT NOT NULL,
            scraped_at TEXT,
            PRIMARY KEY (fund_code, nav_date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds_codes (
            fund_code TEXT NOT NULL REFERENCES funds_master_info(fund_code),
            code TEXT NOT NULL,
            code_type TEXT,
            source TEXT NOT NULL,
            PRIMARY KEY (fund_code, code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS funds_statistics (
            fund_code TEXT PRIMARY KEY NOT NULL REFERENCES funds_master_info(fund_code),
            sharpe_ratio REAL,
            alpha REAL,
            beta REAL,
            max_drawdown REAL,
            recovering_period_days INTEGER,
            tracking_error REAL,
            turnover_ratio REAL,
            fx_hedging REAL,
            source TEXT NOT NULL,
            as_of TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Sync audit trail
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            table_name TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_funds_daily_date ON funds_daily(nav_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_events_table ON sync_events(table_name, timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SYNC EVENTS
// ============================================================================

/// One applied (or failed) changeset
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub table: Table,
    pub data: serde_json::Value,
    pub actor: String,
}

impl SyncEvent {
    pub fn new(event_type: &str, table: Table, data: serde_json::Value, actor: &str) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            table,
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &SyncEvent) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO sync_events (
            event_id, timestamp, event_type, table_name, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.table.name(),
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for one table, newest first
pub fn get_events_for_table(conn: &Connection, table: Table) -> Result<Vec<SyncEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, data, actor
         FROM sync_events
         WHERE table_name = ?1
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![table.name()], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(3)?;

            Ok(SyncEvent {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                table,
                data: serde_json::from_str(&data_json).map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// SYNC APPLIER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub upserted: usize,
    /// Rows actually removed or deactivated
    pub deleted: usize,
}

pub struct SyncApplier<'c> {
    conn: &'c mut Connection,
    actor: String,
}

impl<'c> SyncApplier<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        SyncApplier {
            conn,
            actor: "fund-sync".to_string(),
        }
    }

    /// Apply one table's changeset in a single transaction.
    ///
    /// On failure nothing of this changeset is kept.
    pub fn apply<R: TableRecord>(&mut self, changeset: &Changeset<R>) -> Result<ApplyReport> {
        let table = R::TABLE;
        match apply_in_transaction(self.conn, changeset) {
            Ok(report) => {
                info!(
                    "✓ {}: {} upserted, {} deleted",
                    table.sql_table(),
                    report.upserted,
                    report.deleted
                );
                let event = SyncEvent::new(
                    "changeset_applied",
                    table,
                    serde_json::json!({
                        "adds": changeset.add_count(),
                        "deletes": changeset.delete_count(),
                        "upserted": report.upserted,
                        "deleted": report.deleted,
                    }),
                    &self.actor,
                );
                record_event(self.conn, &event);
                Ok(report)
            }
            Err(source) => {
                error!("{} changeset failed: {}", table.sql_table(), source);
                let event = SyncEvent::new(
                    "changeset_failed",
                    table,
                    serde_json::json!({ "error": source.to_string(), "rows": changeset.len() }),
                    &self.actor,
                );
                record_event(self.conn, &event);
                Err(SyncError::SyncApply { table, source })
            }
        }
    }
}

fn record_event(conn: &Connection, event: &SyncEvent) {
    if let Err(e) = insert_event(conn, event) {
        warn!("could not record {} event for {}: {}", event.event_type, event.table, e);
    }
}

fn apply_in_transaction<R: TableRecord>(
    conn: &mut Connection,
    changeset: &Changeset<R>,
) -> rusqlite::Result<ApplyReport> {
    let tx = conn.transaction()?;
    let mut report = ApplyReport::default();
    {
        let mut upsert = tx.prepare(&upsert_sql::<R>())?;
        let mut delete = tx.prepare(&delete_sql::<R>())?;

        for change in &changeset.rows {
            match change.action {
                SyncAction::Add => {
                    upsert.execute(params_from_iter(row_values(&change.record)))?;
                    report.upserted += 1;
                }
                SyncAction::Delete => {
                    report.deleted += delete.execute(params_from_iter(change.key.parts()))?;
                }
            }
        }
    }
    tx.commit()?;
    Ok(report)
}

/// Column values in COLUMNS order; empty means NULL
fn row_values<R: TableRecord>(record: &R) -> Vec<Option<String>> {
    R::COLUMNS
        .iter()
        .zip(record.fields())
        .map(|(column, value)| {
            if R::TABLE.is_master() && *column == "fund_status" {
                Some(FundStatus::Active.as_str().to_string())
            } else if value.is_empty() {
                None
            } else {
                Some(value)
            }
        })
        .collect()
}

fn upsert_sql<R: TableRecord>() -> String {
    let columns = R::COLUMNS.join(", ");
    let placeholders: Vec<String> = (1..=R::COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = R::COLUMNS
        .iter()
        .filter(|c| !R::KEY_COLUMNS.contains(*c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        R::TABLE.sql_table(),
        columns,
        placeholders.join(", "),
        R::KEY_COLUMNS.join(", "),
        on_conflict
    )
}

fn delete_sql<R: TableRecord>() -> String {
    let predicate: Vec<String> = R::KEY_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", c, i + 1))
        .collect();

    if R::TABLE.is_master() {
        format!(
            "UPDATE {} SET fund_status = '{}' WHERE {}",
            R::TABLE.sql_table(),
            FundStatus::Inactive.as_str(),
            predicate.join(" AND ")
        )
    } else {
        format!("DELETE FROM {} WHERE {}", R::TABLE.sql_table(), predicate.join(" AND "))
    }
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn count_rows(conn: &Connection, table: Table) -> Result<i64> {
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.sql_table()), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

pub fn fund_status(conn: &Connection, fund_code: &str) -> Result<Option<FundStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT fund_status FROM funds_master_info WHERE fund_code = ?1",
            params![fund_code],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.map(|s| FundStatus::parse(&s)))
}

// ============================================================================
// TESTS
// ============================================================================
