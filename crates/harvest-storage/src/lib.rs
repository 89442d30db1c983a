//! Durable storage primitives for the harvest pipeline: atomic files, the
//! append log, storage tiers and the migration journal.

mod files;
mod journal;
mod log;
mod tier;

pub use files::{write_atomic, SnapshotFile};
pub use journal::{MigrationJournal, MigrationTarget, PendingMigration};
pub use log::{AppendError, AppendLog, LogScan};
pub use tier::{
    connect_tier, AccountTier, PgTier, SqliteTier, StorageError, TierBatch, TierLayout,
    WriteSemantics,
};

