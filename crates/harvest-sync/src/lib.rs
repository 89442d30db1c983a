//! Harvest engine: traversal, cooldown, concurrent extraction, checkpoints,
//! tier synchronization and the control surface around them.

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod cooldown;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod synchronizer;

use std::sync::Arc;

use anyhow::{Context, Result};
use harvest_adapters::{FeedProvider, FixtureProvider};
use harvest_storage::AppendLog;
use tokio::sync::{watch, Mutex};

pub use checkpoint::{CheckpointError, CheckpointManager, EngineSnapshot, SNAPSHOT_VERSION};
pub use config::HarvestConfig;
pub use control::{Controller, HarvestStats, SyncOp};
pub use cooldown::{Cooldown, Transition};
pub use engine::{CycleOutcome, EngineParts, HarvestEngine};
pub use error::{EngineError, SyncError};
pub use extraction::{BatchOutcome, BatchReport, ExtractionPool, RecordSink};
pub use notify::{notifier_for, LogNotifier, Notifier, WebhookNotifier};
pub use queue::{QueueError, TraversalQueue};
pub use scheduler::{CycleRunner, CycleScheduler, TriggerResult};
pub use state::{EngineState, EngineStatus};
pub use synchronizer::{
    LogLoadReport, MigrationReport, TierHandle, TierKind, TierStats, TieredSynchronizer,
};

/// How to treat an existing snapshot at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Startup {
    /// Load the snapshot, or initialize when there is none.
    #[default]
    Resume,
    /// Ignore any snapshot and start fresh.
    Reinitialize,
}

/// Every long-lived piece of a harvest process, wired from one config.
pub struct HarvestRuntime {
    pub config: HarvestConfig,
    pub controller: Arc<Controller>,
}

impl HarvestRuntime {
    pub async fn build(
        config: HarvestConfig,
        provider: Arc<dyn FeedProvider>,
        startup: Startup,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;

        let sync = Arc::new(
            TieredSynchronizer::connect(&config)
                .await
                .context("connecting storage tiers")?,
        );
        let log = Arc::new(AppendLog::open(&config.append_log_path).await?);
        let checkpoint =
            CheckpointManager::new(&config.snapshot_path, config.snapshot_queue_threshold);
        let notifier = notifier_for(config.notify_webhook_url.as_deref())?;

        let mut engine = HarvestEngine::new(EngineParts {
            provider,
            checkpoint: checkpoint.clone(),
            log: log.clone(),
            buffer: sync.buffer(),
            notifier,
            comment_limit: config.comment_limit,
            workers: config.worker_pool_size,
            write_through: config.write_through,
        });
        match startup {
            Startup::Resume => engine.load_or_initialize().await?,
            Startup::Reinitialize => engine.reinitialize().await?,
        }

        let runner = Arc::new(CycleRunner::new(Arc::new(Mutex::new(engine))));
        let scheduler = CycleScheduler::new(runner.clone(), &config.cycle_cron).await?;
        let controller = Arc::new(Controller::new(runner, scheduler, sync, checkpoint, log));
        Ok(Self { config, controller })
    }

    /// Runtime over the fixture feed named in the config.
    pub async fn from_config(config: HarvestConfig, startup: Startup) -> Result<Self> {
        let provider = FixtureProvider::from_path(&config.feed_fixture_path)?;
        Self::build(config, Arc::new(provider), startup).await
    }

    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.controller.runner().subscribe_fatal()
    }
}
