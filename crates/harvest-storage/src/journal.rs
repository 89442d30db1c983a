use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::files::SnapshotFile;
use crate::tier::WriteSemantics;

const JOURNAL_VERSION: u32 = 1;

/// One destination of a migration and how rows land in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTarget {
    pub tier: String,
    pub semantics: WriteSemantics,
}

impl MigrationTarget {
    pub fn new(tier: &str, semantics: WriteSemantics) -> Self {
        Self {
            tier: tier.to_string(),
            semantics,
        }
    }
}

/// A tier migration whose source has not been cleared yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub batch_id: Uuid,
    pub source: String,
    pub destinations: Vec<MigrationTarget>,
    pub completed: Vec<String>,
    /// Highest source row id included in the batch.
    pub high_water: i64,
    pub rows: usize,
    pub recorded_at: DateTime<Utc>,
}

impl PendingMigration {
    pub fn new(
        source: &str,
        destinations: Vec<MigrationTarget>,
        high_water: i64,
        rows: usize,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            source: source.to_string(),
            destinations,
            completed: Vec::new(),
            high_water,
            rows,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_completed(&self, destination: &str) -> bool {
        self.completed.iter().any(|d| d == destination)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalFile {
    version: u32,
    pending: Vec<PendingMigration>,
}

/// Durable record of in-flight migrations, rewritten atomically on every change.
#[derive(Debug)]
pub struct MigrationJournal {
    file: SnapshotFile,
    guard: Mutex<()>,
}

impl MigrationJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: SnapshotFile::new(path),
            guard: Mutex::new(()),
        }
    }

    pub async fn pending(&self) -> anyhow::Result<Vec<PendingMigration>> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.pending)
    }

    pub async fn pending_for(&self, source: &str) -> anyhow::Result<Option<PendingMigration>> {
        let _guard = self.guard.lock().await;
        Ok(self
            .load()
            .await?
            .pending
            .into_iter()
            .find(|m| m.source == source))
    }

    /// Record a migration, replacing any earlier entry for the same source.
    pub async fn record(&self, migration: &PendingMigration) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut journal = self.load().await?;
        journal.pending.retain(|m| m.source != migration.source);
        journal.pending.push(migration.clone());
        self.store(&journal).await
    }

    pub async fn mark_completed(&self, batch_id: Uuid, destination: &str) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut journal = self.load().await?;
        let Some(entry) = journal.pending.iter_mut().find(|m| m.batch_id == batch_id) else {
            bail!("migration {batch_id} is not in the journal");
        };
        if !entry.is_completed(destination) {
            entry.completed.push(destination.to_string());
        }
        self.store(&journal).await
    }

    pub async fn resolve(&self, batch_id: Uuid) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut journal = self.load().await?;
        journal.pending.retain(|m| m.batch_id != batch_id);
        self.store(&journal).await
    }

    async fn load(&self) -> anyhow::Result<JournalFile> {
        let Some(bytes) = self.file.read().await? else {
            return Ok(JournalFile {
                version: JOURNAL_VERSION,
                pending: Vec::new(),
            });
        };
        let journal: JournalFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing journal {}", self.file.path().display()))?;
        if journal.version != JOURNAL_VERSION {
            bail!(
                "journal {} has version {}, expected {}",
                self.file.path().display(),
                journal.version,
                JOURNAL_VERSION
            );
        }
        Ok(journal)
    }

    async fn store(&self, journal: &JournalFile) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(journal).context("serializing migration journal")?;
        self.file.write(&bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn pending_entries_survive_reopen_until_resolved() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("journal.json");

        let migration = PendingMigration::new(
            "buffer",
            vec![
                MigrationTarget::new("primary", WriteSemantics::Upsert),
                MigrationTarget::new("archive", WriteSemantics::Append),
            ],
            42,
            3,
        );
        {
            let journal = MigrationJournal::new(&path);
            journal.record(&migration).await.expect("record");
            journal
                .mark_completed(migration.batch_id, "primary")
                .await
                .expect("mark");
        }

        let reopened = MigrationJournal::new(&path);
        let entry = reopened
            .pending_for("buffer")
            .await
            .expect("load")
            .expect("entry present");
        assert!(entry.is_completed("primary"));
        assert!(!entry.is_completed("archive"));
        assert_eq!(entry.high_water, 42);
        assert_eq!(entry.destinations[1].semantics, WriteSemantics::Append);

        reopened.resolve(migration.batch_id).await.expect("resolve");
        assert!(reopened.pending().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn marking_an_unknown_batch_fails() {
        let dir = tempdir().expect("tempdir");
        let journal = MigrationJournal::new(dir.path().join("journal.json"));
        assert!(journal.mark_completed(Uuid::new_v4(), "archive").await.is_err());
    }
}
