use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{CycleOutcome, HarvestEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerResult {
    Ran { outcome: CycleOutcome },
    /// Another cycle held the engine; this trigger was dropped.
    Busy,
    /// A fatal error stopped the engine earlier.
    Halted,
    Failed { error: String },
}

/// Runs cycles without overlap and turns a fatal error into a halt plus a
/// signal for the serving process.
pub struct CycleRunner {
    engine: Arc<Mutex<HarvestEngine>>,
    halted: AtomicBool,
    fatal: watch::Sender<Option<String>>,
}

impl CycleRunner {
    pub fn new(engine: Arc<Mutex<HarvestEngine>>) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            engine,
            halted: AtomicBool::new(false),
            fatal,
        }
    }

    pub fn engine(&self) -> &Arc<Mutex<HarvestEngine>> {
        &self.engine
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Resolves to `Some(message)` once a cycle fails fatally.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    pub async fn trigger(&self) -> TriggerResult {
        if self.is_halted() {
            warn!("engine halted after a fatal error; ignoring trigger");
            return TriggerResult::Halted;
        }
        let Ok(mut engine) = self.engine.try_lock() else {
            warn!("previous cycle still running; skipping trigger");
            return TriggerResult::Busy;
        };
        match engine.run_cycle().await {
            Ok(outcome) => TriggerResult::Ran { outcome },
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "cycle failed fatally; halting");
                self.halted.store(true, Ordering::SeqCst);
                self.fatal.send_replace(Some(message.clone()));
                TriggerResult::Failed { error: message }
            }
        }
    }
}

/// The cron trigger for [`CycleRunner::trigger`]. At most one job is installed.
pub struct CycleScheduler {
    sched: JobScheduler,
    cron: String,
    runner: Arc<CycleRunner>,
    job: Arc<Mutex<Option<Uuid>>>,
}

impl CycleScheduler {
    pub async fn new(runner: Arc<CycleRunner>, cron: &str) -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        sched.start().await.context("starting scheduler")?;
        let job = Arc::new(Mutex::new(None));

        // A fatal cycle removes the trigger.
        let mut fatal = runner.subscribe_fatal();
        let watcher_sched = sched.clone();
        let watcher_job = job.clone();
        tokio::spawn(async move {
            while fatal.changed().await.is_ok() {
                if fatal.borrow().is_none() {
                    continue;
                }
                if let Some(id) = watcher_job.lock().await.take() {
                    if let Err(err) = watcher_sched.remove(&id).await {
                        warn!(error = %err, "could not remove cycle job after fatal error");
                    }
                }
                break;
            }
        });

        Ok(Self {
            sched,
            cron: cron.to_string(),
            runner,
            job,
        })
    }

    /// Returns `false` when the trigger was already installed.
    pub async fn install(&self) -> Result<bool> {
        let mut slot = self.job.lock().await;
        if slot.is_some() {
            return Ok(false);
        }
        let runner = self.runner.clone();
        let job = Job::new_async(self.cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.trigger().await;
            })
        })
        .with_context(|| format!("creating cycle job for cron {}", self.cron))?;
        let id = self.sched.add(job).await.context("adding cycle job")?;
        *slot = Some(id);
        info!(cron = %self.cron, "installed cycle trigger");
        Ok(true)
    }

    /// Returns `false` when no trigger was installed.
    pub async fn remove(&self) -> Result<bool> {
        let Some(id) = self.job.lock().await.take() else {
            return Ok(false);
        };
        self.sched
            .remove(&id)
            .await
            .context("removing cycle job")?;
        info!("removed cycle trigger");
        Ok(true)
    }

    pub async fn is_installed(&self) -> bool {
        self.job.lock().await.is_some()
    }
}
