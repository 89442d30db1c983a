//! Tier-to-tier migration: buffer -> primary -> archive.
//!
//! Every migration is one primitive: read the source up to a row-id high
//! water mark, journal it, write each destination in its own transaction,
//! then delete the source rows at or below the mark. A rerun after a crash
//! first finishes whatever the journal still lists. Destinations apply a
//! batch at most once, so a replay never writes the same batch twice, and an
//! upsert always moves a row above the mark, so the clear never drops a
//! fresher observation that arrived after the read.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use harvest_core::{AccountRecord, DedupIndex};
use harvest_storage::{
    connect_tier, AccountTier, AppendLog, MigrationJournal, MigrationTarget, PendingMigration,
    TierLayout, WriteSemantics,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Buffer,
    Primary,
    Archive,
}

impl TierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Primary => "primary",
            Self::Archive => "archive",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Buffer => "buffer_accounts",
            Self::Primary => "accounts",
            Self::Archive => "archived_accounts",
        }
    }

    pub fn layout(self) -> TierLayout {
        match self {
            Self::Buffer | Self::Primary => TierLayout::Keyed,
            Self::Archive => TierLayout::AppendOnly,
        }
    }
}

/// A tier plus the lock that makes it single-writer.
pub struct TierHandle {
    kind: TierKind,
    tier: Arc<dyn AccountTier>,
    gate: Mutex<()>,
}

impl TierHandle {
    pub fn new(kind: TierKind, tier: Arc<dyn AccountTier>) -> Self {
        Self {
            kind,
            tier,
            gate: Mutex::new(()),
        }
    }

    pub fn tier(&self) -> &dyn AccountTier {
        self.tier.as_ref()
    }

    /// Held for the whole of any write to this tier.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        debug!(tier = self.kind.as_str(), "waiting for tier lock");
        self.gate.lock().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationReport {
    pub tier: TierKind,
    pub semantics: WriteSemantics,
    pub rows_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub source: TierKind,
    pub batch_id: Option<Uuid>,
    pub rows_read: usize,
    pub rows_cleared: u64,
    pub destinations: Vec<DestinationReport>,
    /// Rows of an interrupted earlier migration finished first.
    pub replayed_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogLoadReport {
    pub lines: usize,
    pub loaded: usize,
    pub duplicates: usize,
    pub malformed_lines: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub buffer: u64,
    pub primary: u64,
    pub archive: u64,
}

pub struct TieredSynchronizer {
    buffer: Arc<TierHandle>,
    primary: Arc<TierHandle>,
    archive: Arc<TierHandle>,
    journal: MigrationJournal,
}

/// What one run of [`TieredSynchronizer::complete`] did.
struct Completion {
    destinations: Vec<DestinationReport>,
    rows: usize,
    cleared: u64,
}

impl TieredSynchronizer {
    pub fn new(
        buffer: Arc<dyn AccountTier>,
        primary: Arc<dyn AccountTier>,
        archive: Arc<dyn AccountTier>,
        journal: MigrationJournal,
    ) -> Self {
        Self {
            buffer: Arc::new(TierHandle::new(TierKind::Buffer, buffer)),
            primary: Arc::new(TierHandle::new(TierKind::Primary, primary)),
            archive: Arc::new(TierHandle::new(TierKind::Archive, archive)),
            journal,
        }
    }

    pub async fn connect(config: &HarvestConfig) -> Result<Self, SyncError> {
        let open = |kind: TierKind, url: &str| {
            let url = url.to_string();
            async move { connect_tier(&url, kind.table(), kind.layout()).await }
        };
        Ok(Self::new(
            open(TierKind::Buffer, &config.buffer_url).await?,
            open(TierKind::Primary, &config.primary_url).await?,
            open(TierKind::Archive, &config.archive_url).await?,
            MigrationJournal::new(&config.journal_path),
        ))
    }

    pub fn handle(&self, kind: TierKind) -> &Arc<TierHandle> {
        match kind {
            TierKind::Buffer => &self.buffer,
            TierKind::Primary => &self.primary,
            TierKind::Archive => &self.archive,
        }
    }

    pub fn buffer(&self) -> Arc<TierHandle> {
        self.buffer.clone()
    }

    pub async fn flush_buffer_to_primary(&self) -> Result<MigrationReport, SyncError> {
        self.migrate(TierKind::Buffer, TierKind::Primary, WriteSemantics::Upsert)
            .await
    }

    pub async fn flush_buffer_to_archive(&self) -> Result<MigrationReport, SyncError> {
        self.migrate(TierKind::Buffer, TierKind::Archive, WriteSemantics::Append)
            .await
    }

    pub async fn archive_primary(&self) -> Result<MigrationReport, SyncError> {
        self.migrate(TierKind::Primary, TierKind::Archive, WriteSemantics::Append)
            .await
    }

    /// Copy the buffer into both primary and archive, then clear it once.
    pub async fn backup(&self) -> Result<MigrationReport, SyncError> {
        self.migrate_fanout(
            TierKind::Buffer,
            &[
                (TierKind::Primary, WriteSemantics::Upsert),
                (TierKind::Archive, WriteSemantics::Append),
            ],
        )
        .await
    }

    pub async fn migrate(
        &self,
        source: TierKind,
        destination: TierKind,
        semantics: WriteSemantics,
    ) -> Result<MigrationReport, SyncError> {
        self.migrate_fanout(source, &[(destination, semantics)]).await
    }

    pub async fn migrate_fanout(
        &self,
        source: TierKind,
        targets: &[(TierKind, WriteSemantics)],
    ) -> Result<MigrationReport, SyncError> {
        if targets.iter().any(|(kind, _)| *kind == source) {
            return Err(SyncError::SameTier(source.as_str()));
        }
        let span = info_span!("tier_migration", source = source.as_str());
        self.migrate_locked(source, targets).instrument(span).await
    }

    async fn migrate_locked(
        &self,
        source: TierKind,
        targets: &[(TierKind, WriteSemantics)],
    ) -> Result<MigrationReport, SyncError> {
        let (_guards, interrupted) = self.lock_for(source, targets).await?;

        let replayed_rows = match interrupted {
            Some(pending) => self.replay(&pending).await?,
            None => 0,
        };

        let Some(pending) = self.begin(source, targets).await? else {
            return Ok(MigrationReport {
                source,
                batch_id: None,
                rows_read: 0,
                rows_cleared: 0,
                destinations: Vec::new(),
                replayed_rows,
            });
        };
        let done = self.complete(&pending).await?;
        info!(
            rows = done.rows,
            cleared = done.cleared,
            batch_id = %pending.batch_id,
            "tier migration finished"
        );
        Ok(MigrationReport {
            source,
            batch_id: Some(pending.batch_id),
            rows_read: done.rows,
            rows_cleared: done.cleared,
            destinations: done.destinations,
            replayed_rows,
        })
    }

    /// Bulk-load an append log into the buffer. Later lines win over earlier
    /// lines for the same identity.
    pub async fn load_log_into_buffer(&self, path: &Path) -> Result<LogLoadReport, SyncError> {
        let scan = AppendLog::scan(path).await.map_err(SyncError::Log)?;
        let mut report = LogLoadReport {
            lines: scan.records.len() + scan.malformed_lines.len(),
            malformed_lines: scan.malformed_lines,
            ..LogLoadReport::default()
        };

        let mut seen = DedupIndex::new();
        let mut newest = Vec::with_capacity(scan.records.len());
        for record in scan.records.into_iter().rev() {
            if seen.insert(&record.identity) {
                newest.push(record);
            } else {
                report.duplicates += 1;
            }
        }
        newest.reverse();

        let _guard = self.buffer.lock().await;
        self.buffer
            .tier()
            .write_batch(&newest, WriteSemantics::Upsert)
            .await?;
        report.loaded = newest.len();
        info!(
            path = %path.display(),
            loaded = report.loaded,
            duplicates = report.duplicates,
            malformed = report.malformed_lines.len(),
            "loaded append log into buffer"
        );
        Ok(report)
    }

    /// Latest primary-store row per identity; `None` when absent.
    pub async fn query(
        &self,
        identities: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<AccountRecord>>, SyncError> {
        Ok(self.primary.tier().lookup(identities).await?)
    }

    pub async fn query_found(
        &self,
        identities: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, bool>, SyncError> {
        Ok(self
            .query(identities)
            .await?
            .into_iter()
            .map(|(identity, record)| (identity, record.is_some()))
            .collect())
    }

    pub async fn stats(&self) -> Result<TierStats, SyncError> {
        Ok(TierStats {
            buffer: self.buffer.tier().count().await?,
            primary: self.primary.tier().count().await?,
            archive: self.archive.tier().count().await?,
        })
    }

    /// Always acquires in [`TierKind`] order.
    async fn lock_all<'a>(&'a self, kinds: &BTreeSet<TierKind>) -> Vec<MutexGuard<'a, ()>> {
        let mut guards = Vec::with_capacity(kinds.len());
        for kind in kinds {
            guards.push(self.handle(*kind).lock().await);
        }
        guards
    }

    /// Lock the source, the requested destinations and the destinations of
    /// any interrupted migration from the same source. Returns that
    /// interrupted migration, read while the locks are held.
    async fn lock_for(
        &self,
        source: TierKind,
        targets: &[(TierKind, WriteSemantics)],
    ) -> Result<(Vec<MutexGuard<'_, ()>>, Option<PendingMigration>), SyncError> {
        let mut involved = std::iter::once(source)
            .chain(targets.iter().map(|(kind, _)| *kind))
            .collect::<BTreeSet<_>>();
        loop {
            let guards = self.lock_all(&involved).await;
            let pending = self
                .journal
                .pending_for(source.as_str())
                .await
                .map_err(SyncError::Journal)?;
            let mut needed = involved.clone();
            if let Some(pending) = &pending {
                for target in &pending.destinations {
                    needed.insert(tier_kind(&target.tier)?);
                }
            }
            if needed == involved {
                return Ok((guards, pending));
            }
            drop(guards);
            involved = needed;
        }
    }

    async fn replay(&self, pending: &PendingMigration) -> Result<usize, SyncError> {
        warn!(
            batch_id = %pending.batch_id,
            completed = ?pending.completed,
            "finishing interrupted tier migration"
        );
        Ok(self.complete(pending).await?.rows)
    }

    /// Read the source and journal the batch. `None` when the source is empty.
    async fn begin(
        &self,
        source: TierKind,
        targets: &[(TierKind, WriteSemantics)],
    ) -> Result<Option<PendingMigration>, SyncError> {
        let batch = self.handle(source).tier().read_all().await?;
        let Some(high_water) = batch.high_water else {
            return Ok(None);
        };
        let pending = PendingMigration::new(
            source.as_str(),
            targets
                .iter()
                .map(|(kind, semantics)| MigrationTarget::new(kind.as_str(), *semantics))
                .collect(),
            high_water,
            batch.records.len(),
        );
        self.journal
            .record(&pending)
            .await
            .map_err(SyncError::Journal)?;
        Ok(Some(pending))
    }

    /// Write every destination not yet marked complete.
    async fn copy(&self, pending: &PendingMigration) -> Result<Vec<DestinationReport>, SyncError> {
        let source = tier_kind(&pending.source)?;
        let batch = self
            .handle(source)
            .tier()
            .read_through(pending.high_water)
            .await?;

        let mut reports = Vec::with_capacity(pending.destinations.len());
        for target in &pending.destinations {
            let kind = tier_kind(&target.tier)?;
            if pending.is_completed(&target.tier) {
                reports.push(DestinationReport {
                    tier: kind,
                    semantics: target.semantics,
                    rows_written: 0,
                });
                continue;
            }
            let applied = self
                .handle(kind)
                .tier()
                .apply_batch(&pending.batch_id.to_string(), &batch.records, target.semantics)
                .await?;
            let rows_written = match applied {
                Some(rows) => rows,
                None => {
                    info!(
                        batch_id = %pending.batch_id,
                        tier = kind.as_str(),
                        "batch already applied, skipping destination"
                    );
                    0
                }
            };
            self.journal
                .mark_completed(pending.batch_id, &target.tier)
                .await
                .map_err(SyncError::Journal)?;
            reports.push(DestinationReport {
                tier: kind,
                semantics: target.semantics,
                rows_written,
            });
        }
        Ok(reports)
    }

    /// Copy, clear the source through the high water mark, reclaim space,
    /// and drop the journal entry.
    async fn complete(&self, pending: &PendingMigration) -> Result<Completion, SyncError> {
        let destinations = self.copy(pending).await?;
        let source = self.handle(tier_kind(&pending.source)?).tier();
        let cleared = source.clear_through(pending.high_water).await?;
        source.compact().await?;
        self.journal
            .resolve(pending.batch_id)
            .await
            .map_err(SyncError::Journal)?;
        Ok(Completion {
            destinations,
            rows: pending.rows,
            cleared,
        })
    }
}

fn tier_kind(name: &str) -> Result<TierKind, SyncError> {
    match name {
        "buffer" => Ok(TierKind::Buffer),
        "primary" => Ok(TierKind::Primary),
        "archive" => Ok(TierKind::Archive),
        other => Err(SyncError::Journal(anyhow::anyhow!(
            "journal names unknown tier {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_storage::SqliteTier;
    use tempfile::{tempdir, TempDir};

    fn record(identity: &str, followers: u64) -> AccountRecord {
        AccountRecord {
            identity: identity.to_string(),
            post_count: 3,
            follower_count: followers,
            following_count: 7,
            is_private: false,
            bio_has_contact_marker: false,
            has_external_link: true,
            is_verified: false,
        }
    }

    async fn synchronizer() -> (TempDir, TieredSynchronizer) {
        let dir = tempdir().expect("tempdir");
        let tier = |kind: TierKind| async move {
            Arc::new(
                SqliteTier::in_memory(kind.table(), kind.layout())
                    .await
                    .expect("tier"),
            ) as Arc<dyn AccountTier>
        };
        let sync = TieredSynchronizer::new(
            tier(TierKind::Buffer).await,
            tier(TierKind::Primary).await,
            tier(TierKind::Archive).await,
            MigrationJournal::new(dir.path().join("migrations.json")),
        );
        (dir, sync)
    }

    async fn seed_buffer(sync: &TieredSynchronizer, records: &[AccountRecord]) {
        sync.buffer
            .tier()
            .write_batch(records, WriteSemantics::Upsert)
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn flush_to_primary_upserts_and_clears_buffer() {
        let (_dir, sync) = synchronizer().await;
        sync.primary
            .tier()
            .write_batch(&[record("a", 1)], WriteSemantics::Upsert)
            .await
            .expect("seed primary");
        seed_buffer(&sync, &[record("a", 50), record("b", 2)]).await;

        let report = sync.flush_buffer_to_primary().await.expect("flush");
        assert_eq!(report.rows_read, 2);
        assert_eq!(report.rows_cleared, 2);

        let stats = sync.stats().await.expect("stats");
        assert_eq!(stats, TierStats { buffer: 0, primary: 2, archive: 0 });
        let found = sync
            .query(&BTreeSet::from(["a".to_string(), "zzz".to_string()]))
            .await
            .expect("query");
        assert_eq!(found["a"].as_ref().map(|r| r.follower_count), Some(50));
        assert!(found["zzz"].is_none());
    }

    #[tokio::test]
    async fn second_flush_with_empty_buffer_changes_nothing() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1), record("b", 2)]).await;
        sync.flush_buffer_to_primary().await.expect("first");
        let before = sync.primary.tier().read_all().await.expect("read");

        let report = sync.flush_buffer_to_primary().await.expect("second");
        assert_eq!(report.batch_id, None);
        let after = sync.primary.tier().read_all().await.expect("read");
        assert_eq!(before.records, after.records);
    }

    #[tokio::test]
    async fn archive_replay_after_crash_before_clear_does_not_duplicate() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1), record("b", 2)]).await;

        // Crash after the archive append, before the buffer is cleared.
        let pending = sync
            .begin(TierKind::Buffer, &[(TierKind::Archive, WriteSemantics::Append)])
            .await
            .expect("begin")
            .expect("batch");
        sync.copy(&pending).await.expect("copy");
        assert_eq!(sync.stats().await.expect("stats").archive, 2);
        assert_eq!(sync.stats().await.expect("stats").buffer, 2);

        let report = sync.flush_buffer_to_archive().await.expect("rerun");
        assert_eq!(report.replayed_rows, 2);
        assert_eq!(report.batch_id, None);

        let stats = sync.stats().await.expect("stats");
        assert_eq!(stats.archive, 2);
        assert_eq!(stats.buffer, 0);
        assert!(sync.journal.pending().await.expect("journal").is_empty());
    }

    #[tokio::test]
    async fn archive_replay_after_crash_before_journal_update_does_not_duplicate() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1), record("b", 2)]).await;

        // The archive commit lands but the journal never hears about it.
        let pending = sync
            .begin(TierKind::Buffer, &[(TierKind::Archive, WriteSemantics::Append)])
            .await
            .expect("begin")
            .expect("batch");
        let rows = sync.buffer.tier().read_all().await.expect("read").records;
        sync.archive
            .tier()
            .apply_batch(&pending.batch_id.to_string(), &rows, WriteSemantics::Append)
            .await
            .expect("archive commit");

        let report = sync.flush_buffer_to_archive().await.expect("rerun");
        assert_eq!(report.replayed_rows, 2);
        let stats = sync.stats().await.expect("stats");
        assert_eq!(stats.archive, 2);
        assert_eq!(stats.buffer, 0);
    }

    #[tokio::test]
    async fn replay_keeps_an_observation_that_arrived_after_the_crash() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1)]).await;

        // Primary is written and marked complete, then the process dies
        // before the buffer is cleared.
        let pending = sync
            .begin(TierKind::Buffer, &[(TierKind::Primary, WriteSemantics::Upsert)])
            .await
            .expect("begin")
            .expect("batch");
        sync.copy(&pending).await.expect("copy");
        seed_buffer(&sync, &[record("a", 999)]).await;

        sync.flush_buffer_to_primary().await.expect("rerun");

        let found = sync
            .query(&BTreeSet::from(["a".to_string()]))
            .await
            .expect("query");
        assert_eq!(found["a"].as_ref().map(|r| r.follower_count), Some(999));
        assert_eq!(sync.stats().await.expect("stats").buffer, 0);
    }

    #[tokio::test]
    async fn replayed_backup_waits_for_the_primary_lock() {
        let (_dir, sync) = synchronizer().await;
        let sync = Arc::new(sync);
        seed_buffer(&sync, &[record("a", 1)]).await;
        sync.begin(
            TierKind::Buffer,
            &[
                (TierKind::Primary, WriteSemantics::Upsert),
                (TierKind::Archive, WriteSemantics::Append),
            ],
        )
        .await
        .expect("begin")
        .expect("batch");

        let primary_guard = sync.primary.lock().await;
        let mut flush = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.flush_buffer_to_archive().await })
        };
        let early = tokio::time::timeout(std::time::Duration::from_millis(100), &mut flush).await;
        assert!(early.is_err(), "replay wrote primary without its lock");
        assert_eq!(sync.primary.tier().count().await.expect("count"), 0);

        drop(primary_guard);
        let report = flush.await.expect("join").expect("flush");
        assert_eq!(report.replayed_rows, 1);
        assert_eq!(
            sync.stats().await.expect("stats"),
            TierStats { buffer: 0, primary: 1, archive: 1 }
        );
    }

    #[tokio::test]
    async fn rows_written_after_the_read_survive_the_clear() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1)]).await;
        let pending = sync
            .begin(TierKind::Buffer, &[(TierKind::Primary, WriteSemantics::Upsert)])
            .await
            .expect("begin")
            .expect("batch");
        seed_buffer(&sync, &[record("late", 9)]).await;

        sync.complete(&pending).await.expect("complete");
        let left = sync.buffer.tier().read_all().await.expect("read");
        assert_eq!(left.records, vec![record("late", 9)]);
    }

    #[tokio::test]
    async fn archive_primary_appends_history() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1)]).await;
        sync.flush_buffer_to_primary().await.expect("flush");
        sync.archive_primary().await.expect("archive");
        seed_buffer(&sync, &[record("a", 2)]).await;
        sync.flush_buffer_to_primary().await.expect("flush");
        sync.archive_primary().await.expect("archive");

        let stats = sync.stats().await.expect("stats");
        assert_eq!(stats, TierStats { buffer: 0, primary: 0, archive: 2 });
    }

    #[tokio::test]
    async fn backup_fans_out_and_clears_once() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1), record("b", 2)]).await;

        let report = sync.backup().await.expect("backup");
        assert_eq!(report.destinations.len(), 2);
        assert!(report.destinations.iter().all(|d| d.rows_written == 2));
        assert_eq!(
            sync.stats().await.expect("stats"),
            TierStats { buffer: 0, primary: 2, archive: 2 }
        );
    }

    #[tokio::test]
    async fn same_tier_migration_is_rejected() {
        let (_dir, sync) = synchronizer().await;
        let err = sync
            .migrate(TierKind::Primary, TierKind::Primary, WriteSemantics::Upsert)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::SameTier("primary")));
    }

    #[tokio::test]
    async fn log_load_keeps_newest_line_per_identity() {
        let (dir, sync) = synchronizer().await;
        let path = dir.path().join("accounts.csv");
        std::fs::write(
            &path,
            "a,1,10,1,0,0,0,0\nb,1,20,1,0,0,0,0\nnot,a,record\na,1,99,1,0,1,0,0\n",
        )
        .expect("seed log");

        let report = sync.load_log_into_buffer(&path).await.expect("load");
        assert_eq!(report.lines, 4);
        assert_eq!(report.loaded, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.malformed_lines, vec![3]);

        let found = sync
            .buffer
            .tier()
            .lookup(&BTreeSet::from(["a".to_string()]))
            .await
            .expect("lookup");
        assert_eq!(found["a"].as_ref().map(|r| r.follower_count), Some(99));
    }

    #[tokio::test]
    async fn query_found_reports_presence_only() {
        let (_dir, sync) = synchronizer().await;
        seed_buffer(&sync, &[record("a", 1)]).await;
        sync.flush_buffer_to_primary().await.expect("flush");
        let found = sync
            .query_found(&BTreeSet::from(["a".to_string(), "b".to_string()]))
            .await
            .expect("query");
        assert_eq!(found, BTreeMap::from([("a".to_string(), true), ("b".to_string(), false)]));
    }
}
