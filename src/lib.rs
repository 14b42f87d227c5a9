// Fund Sync - Core Library
// Reconciliation and incremental sync for Thai mutual fund data.
// Shared by the fund-merge and fund-sync stage binaries and the tests.

pub mod arbitration;  // Source selection + NAV merge
pub mod checkpoint;   // Daily resume log
pub mod config;
pub mod coordinator;  // Worker pool over fund units
pub mod db;           // Datastore schema + sync applier
pub mod diff;         // Snapshot diff with cascade delete
pub mod error;
pub mod fetch;        // Raw fragment access
pub mod logging;
pub mod normalizer;   // Raw text -> canonical records
pub mod pipeline;     // fund-merge / fund-sync stages
pub mod records;
pub mod retry;
pub mod snapshot;     // Snapshot files, work files, changesets

// Re-export commonly used types
pub use arbitration::SourceArbitrator;
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::PipelineConfig;
pub use coordinator::{Coordinator, CoordinatorContext, CoordinatorReport};
pub use db::{open_database, setup_database, SyncApplier, SyncEvent};
pub use diff::{Changeset, DeletedFundSet, DiffEngine};
pub use error::{Result, SyncError};
pub use fetch::{CsvFragmentSource, FragmentSource, RawUnit};
pub use logging::{init_tracing, ErrorCapture};
pub use normalizer::{HoldingType, HoldingTypeCache, ParseReport, RawRow};
pub use pipeline::{
    is_skip_day, run_merge_stage, run_sync_stage, MergeSummary, SyncSummary, TableStatus,
};
pub use records::{
    AllocationRecord, BusinessKey, CodeRecord, DailyNavRecord, FeeRecord, FundRecord,
    FundStatus, HoldingRecord, Source, StatisticsRecord, SyncAction, Table, TableRecord,
    UnitRecords,
};
pub use snapshot::{Snapshot, WorkFiles};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
