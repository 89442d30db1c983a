//! Operator-facing control surface shared by the CLI and the web router.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use harvest_core::AccountRecord;
use harvest_storage::AppendLog;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::checkpoint::CheckpointManager;
use crate::engine::HarvestEngine;
use crate::extraction::BatchReport;
use crate::scheduler::{CycleRunner, CycleScheduler, TriggerResult};
use crate::state::EngineStatus;
use crate::synchronizer::{LogLoadReport, MigrationReport, TierStats, TieredSynchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOp {
    FlushPrimary,
    FlushArchive,
    ArchivePrimary,
    Backup,
}

impl FromStr for SyncOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flush-primary" => Ok(Self::FlushPrimary),
            "flush-archive" => Ok(Self::FlushArchive),
            "archive-primary" => Ok(Self::ArchivePrimary),
            "backup" => Ok(Self::Backup),
            other => bail!("unknown sync operation {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HarvestStats {
    pub tiers: TierStats,
    pub append_log_bytes: u64,
}

pub struct Controller {
    runner: Arc<CycleRunner>,
    scheduler: CycleScheduler,
    sync: Arc<TieredSynchronizer>,
    checkpoint: CheckpointManager,
    log: Arc<AppendLog>,
}

impl Controller {
    pub fn new(
        runner: Arc<CycleRunner>,
        scheduler: CycleScheduler,
        sync: Arc<TieredSynchronizer>,
        checkpoint: CheckpointManager,
        log: Arc<AppendLog>,
    ) -> Self {
        Self {
            runner,
            scheduler,
            sync,
            checkpoint,
            log,
        }
    }

    fn engine(&self) -> &Arc<Mutex<HarvestEngine>> {
        self.runner.engine()
    }

    pub fn runner(&self) -> &Arc<CycleRunner> {
        &self.runner
    }

    /// Last persisted state. May trail a cycle that is still running.
    pub async fn status(&self) -> Result<EngineStatus> {
        let mut status = match self.checkpoint.load_snapshot().await? {
            Some(snapshot) => snapshot.status(),
            None => EngineStatus::default(),
        };
        status.scheduled = self.scheduler.is_installed().await;
        Ok(status)
    }

    pub async fn reset_cooldown(&self) -> Result<EngineStatus> {
        self.engine().lock().await.reset().await?;
        self.status().await
    }

    pub async fn reinitialize(&self) -> Result<EngineStatus> {
        self.engine().lock().await.reinitialize().await?;
        self.status().await
    }

    /// Reset cooldown, then install the cron trigger.
    pub async fn start(&self) -> Result<EngineStatus> {
        if self.runner.is_halted() {
            bail!("engine halted after a fatal error; restart the process");
        }
        self.reset_cooldown().await?;
        self.scheduler.install().await?;
        self.status().await
    }

    pub async fn stop(&self) -> Result<EngineStatus> {
        self.scheduler.remove().await?;
        self.status().await
    }

    pub async fn run_now(&self) -> TriggerResult {
        self.runner.trigger().await
    }

    pub async fn stats(&self) -> Result<HarvestStats> {
        let tiers = self.sync.stats().await?;
        let append_log_bytes = self.log.size_bytes().await?;
        Ok(HarvestStats {
            tiers,
            append_log_bytes,
        })
    }

    pub async fn sync(&self, op: SyncOp) -> Result<MigrationReport> {
        info!(?op, "running tier sync");
        let report = match op {
            SyncOp::FlushPrimary => self.sync.flush_buffer_to_primary().await?,
            SyncOp::FlushArchive => self.sync.flush_buffer_to_archive().await?,
            SyncOp::ArchivePrimary => self.sync.archive_primary().await?,
            SyncOp::Backup => self.sync.backup().await?,
        };
        Ok(report)
    }

    pub async fn load_log(&self, path: Option<&Path>) -> Result<LogLoadReport> {
        let path = path.unwrap_or_else(|| self.log.path());
        Ok(self.sync.load_log_into_buffer(path).await?)
    }

    pub async fn query(
        &self,
        identities: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<AccountRecord>>> {
        Ok(self.sync.query(identities).await?)
    }

    pub async fn query_found(
        &self,
        identities: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, bool>> {
        Ok(self.sync.query_found(identities).await?)
    }

    pub async fn harvest_accounts(&self, identities: Vec<String>) -> Result<BatchReport> {
        Ok(self.engine().lock().await.harvest_accounts(identities).await?)
    }

    pub async fn harvest_similar(&self, identity: &str) -> Result<BatchReport> {
        Ok(self.engine().lock().await.harvest_similar(identity).await?)
    }

    pub async fn harvest_accounts_file(&self, path: &Path) -> Result<BatchReport> {
        Ok(self
            .engine()
            .lock()
            .await
            .harvest_accounts_file(path)
            .await?)
    }
}
