// 🚨 Error Taxonomy - what can go wrong during merge and sync
//
// Only MissingMasterSnapshot is fatal to a stage. Everything else is either
// retried (TransientFetch), absorbed into the data (Parse, OrphanReference)
// or isolated to one table (SyncApply).

use std::path::PathBuf;
use thiserror::Error;

use crate::records::Table;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Source unavailable for one unit (I/O failure, timeout)
    #[error("transient fetch error for {unit}: {reason}")]
    TransientFetch { unit: String, reason: String },

    /// Unexpected date/number shape; the field becomes null
    #[error("cannot parse {field} from {value:?}")]
    Parse { field: String, value: String },

    /// Dependent row pointing at a fund_code the master snapshot does not know
    #[error("{table} row references unknown fund_code {fund_code}")]
    OrphanReference { table: Table, fund_code: String },

    /// Datastore write failure for one table's changeset
    #[error("failed to apply {table} changeset: {source}")]
    SyncApply {
        table: Table,
        #[source]
        source: rusqlite::Error,
    },

    #[error("master snapshot not found: {0}")]
    MissingMasterSnapshot(PathBuf),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the retry combinator should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientFetch { .. })
    }

    pub fn transient(unit: &str, reason: impl ToString) -> Self {
        SyncError::TransientFetch {
            unit: unit.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
