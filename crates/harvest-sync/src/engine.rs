//! One traversal/extraction cycle and the operations around it.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use harvest_adapters::{FeedProvider, ProfileExtractor};
use harvest_core::Post;
use harvest_storage::AppendLog;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::checkpoint::CheckpointManager;
use crate::cooldown::Transition;
use crate::error::EngineError;
use crate::extraction::{BatchOutcome, BatchReport, ExtractionPool, RecordSink};
use crate::notify::Notifier;
use crate::queue::collect_unseen;
use crate::state::{EngineState, EngineStatus};
use crate::synchronizer::TierHandle;

/// Collaborators and knobs for a [`HarvestEngine`].
pub struct EngineParts {
    pub provider: Arc<dyn FeedProvider>,
    pub checkpoint: CheckpointManager,
    pub log: Arc<AppendLog>,
    pub buffer: Arc<TierHandle>,
    pub notifier: Arc<dyn Notifier>,
    pub comment_limit: usize,
    pub workers: usize,
    pub write_through: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Cooling down; nothing ran.
    Skipped,
    Refilled { added: usize },
    Extracted(BatchReport),
    /// A single post or account was unavailable; the cycle moved on.
    ItemSkipped { reason: String },
    EnteredCooldown { reason: String },
}

pub struct HarvestEngine {
    provider: Arc<dyn FeedProvider>,
    pool: ExtractionPool,
    checkpoint: CheckpointManager,
    log: Arc<AppendLog>,
    buffer: Arc<TierHandle>,
    notifier: Arc<dyn Notifier>,
    comment_limit: usize,
    write_through: bool,
    state: EngineState,
}

impl HarvestEngine {
    /// Engine with empty state. Call [`HarvestEngine::load_or_initialize`]
    /// or [`HarvestEngine::reinitialize`] before running cycles.
    pub fn new(parts: EngineParts) -> Self {
        let pool = ExtractionPool::new(
            ProfileExtractor::new(parts.provider.clone()),
            parts.workers,
        );
        Self {
            provider: parts.provider,
            pool,
            checkpoint: parts.checkpoint,
            log: parts.log,
            buffer: parts.buffer,
            notifier: parts.notifier,
            comment_limit: parts.comment_limit.max(1),
            write_through: parts.write_through,
            state: EngineState::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    pub fn log(&self) -> &Arc<AppendLog> {
        &self.log
    }

    /// Resume from the snapshot, or start fresh when there is none. A snapshot
    /// with a foreign version is refused; see [`HarvestEngine::reinitialize`].
    pub async fn load_or_initialize(&mut self) -> Result<(), EngineError> {
        match self.checkpoint.load().await? {
            Some(state) => {
                info!(
                    queue_len = state.queue.len(),
                    cooling = state.cooldown.is_cooling(),
                    "resumed engine from snapshot"
                );
                self.state = state;
                Ok(())
            }
            None => self.initialize().await,
        }
    }

    /// Discard whatever snapshot exists and start fresh.
    pub async fn reinitialize(&mut self) -> Result<(), EngineError> {
        warn!(path = %self.checkpoint.path().display(), "reinitializing engine state");
        self.initialize().await
    }

    /// Fresh state whose watermark is the newest post in the feed right now,
    /// so nothing historical gets queued.
    async fn initialize(&mut self) -> Result<(), EngineError> {
        let mut state = EngineState {
            watermark: self.newest_in_feed().await?,
            ..EngineState::default()
        };
        self.checkpoint.save(&mut state).await?;
        info!(watermark = ?state.watermark, "initialized engine state");
        self.state = state;
        Ok(())
    }

    async fn newest_in_feed(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        let mut feed = self.provider.feed().await?;
        match feed.next().await {
            Some(post) => Ok(Some(post?.published_at)),
            None => Ok(None),
        }
    }

    /// Queue every feed post newer than the watermark. Returns how many were added.
    pub async fn refill(&mut self) -> Result<usize, EngineError> {
        let feed = self.provider.feed().await?;
        let unseen = collect_unseen(feed, self.state.watermark).await?;
        let added = self.state.queue.refill(unseen, &mut self.state.watermark);
        info!(added, watermark = ?self.state.watermark, "refilled traversal queue");
        Ok(added)
    }

    pub async fn extract_comments(&self, post: &Post, limit: usize) -> BatchOutcome {
        let authors = match self.provider.comment_authors(post).await {
            Ok(authors) => authors,
            Err(err) => {
                return BatchOutcome {
                    report: BatchReport {
                        post_id: Some(post.id.clone()),
                        ..BatchReport::default()
                    },
                    failure: Some(err.into()),
                }
            }
        };
        let mut sink = RecordSink::new().with_log(self.log.clone());
        if self.write_through {
            sink = sink.with_buffer(self.buffer.clone());
        }
        self.pool.extract_comments(post, authors, limit, &sink).await
    }

    /// One scheduled cycle: extract the top post when the queue has one,
    /// otherwise refill. Fatal failures are returned after a best-effort save.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, EngineError> {
        let span = info_span!(
            "harvest_cycle",
            queue_len = self.state.queue.len(),
            cooling = self.state.cooldown.is_cooling()
        );
        self.run_cycle_inner().instrument(span).await
    }

    async fn run_cycle_inner(&mut self) -> Result<CycleOutcome, EngineError> {
        self.notifier
            .notify(&format!("Starting data collection, {}", Utc::now().to_rfc3339()))
            .await;
        if self.state.cooldown.is_cooling() {
            warn!("cooldown in effect, skipping cycle");
            self.notifier
                .notify(&format!("Cooldown required, {}", Utc::now().to_rfc3339()))
                .await;
            return Ok(CycleOutcome::Skipped);
        }
        self.state.last_run = Some(Utc::now());

        let attempt = if self.state.queue.is_empty() {
            self.refill()
                .await
                .map(|added| CycleOutcome::Refilled { added })
        } else {
            self.extract_top().await
        };

        match attempt {
            Ok(outcome) => {
                self.save().await?;
                Ok(outcome)
            }
            Err(err) => self.handle_failure(err).await,
        }
    }

    async fn extract_top(&mut self) -> Result<CycleOutcome, EngineError> {
        let post = self.state.queue.pop()?;
        let outcome = self.extract_comments(&post, self.comment_limit).await;
        if let Some(failure) = outcome.failure {
            return Err(failure);
        }
        let report = outcome.report;
        self.notifier
            .notify(&format!(
                "Time to get commenters: {:.2} seconds",
                report.elapsed_ms as f64 / 1000.0
            ))
            .await;
        match self.log.size_bytes().await {
            Ok(bytes) => {
                self.notifier
                    .notify(&format!(
                        "{} size: {:.3} MB",
                        self.log.path().display(),
                        bytes as f64 / (1024.0 * 1024.0)
                    ))
                    .await
            }
            Err(err) => warn!(error = %err, "could not stat append log"),
        }
        self.notifier.notify("Finished round of data collection").await;
        Ok(CycleOutcome::Extracted(report))
    }

    async fn handle_failure(&mut self, err: EngineError) -> Result<CycleOutcome, EngineError> {
        let class = err.class();
        match self.state.cooldown.on_failure(class) {
            Transition::Continue => {
                warn!(error = %err, "item unavailable, continuing");
                self.notifier.notify(&format!("Not found: {err}")).await;
                self.save().await?;
                Ok(CycleOutcome::ItemSkipped {
                    reason: err.to_string(),
                })
            }
            Transition::EnteredCooldown => {
                warn!(error = %err, "provider pressure, entering cooldown");
                self.notifier
                    .notify(&format!(
                        "Provider unavailable, cooling down, {}: {err}",
                        Utc::now().to_rfc3339()
                    ))
                    .await;
                self.save().await?;
                Ok(CycleOutcome::EnteredCooldown {
                    reason: err.to_string(),
                })
            }
            Transition::Fatal => {
                error!(error = %err, ?class, "fatal cycle error");
                self.notifier
                    .notify(&format!("Fatal error, stopping: {err}"))
                    .await;
                if let Err(save_err) = self.save().await {
                    error!(error = %save_err, "could not persist snapshot after fatal error");
                }
                Err(err)
            }
        }
    }

    /// Operator reset: leave cooldown and resynchronize the watermark with
    /// the newest post currently in the feed.
    pub async fn reset(&mut self) -> Result<(), EngineError> {
        let newest = self.newest_in_feed().await?;
        let was_cooling = self.state.cooldown.reset();
        if newest.is_some() {
            self.state.watermark = newest;
        }
        info!(was_cooling, watermark = ?self.state.watermark, "engine reset");
        self.save().await
    }

    pub async fn save(&mut self) -> Result<(), EngineError> {
        let report = self.checkpoint.save(&mut self.state).await?;
        if let Some(len) = report.compacted_from {
            self.notifier
                .notify(&format!(
                    "Too many posts queued ({len}); kept only the newest before saving"
                ))
                .await;
        }
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            initialized: true,
            cooldown: self.state.cooldown.is_cooling(),
            watermark: self.state.watermark,
            queue_head_identity: self.state.queue_head_identity(),
            queue_len: self.state.queue.len(),
            last_run: self.state.last_run,
            saved_at: None,
            scheduled: false,
        }
    }

    /// Extract explicit handles straight into the local buffer.
    pub async fn harvest_accounts(
        &self,
        identities: Vec<String>,
    ) -> Result<BatchReport, EngineError> {
        let sink = RecordSink::new().with_buffer(self.buffer.clone());
        let outcome = self.pool.extract_identities(identities, &sink).await;
        match outcome.failure {
            Some(err) => Err(err),
            None => Ok(outcome.report),
        }
    }

    /// Extract the accounts the provider lists as similar to `identity` into
    /// the local buffer.
    pub async fn harvest_similar(&self, identity: &str) -> Result<BatchReport, EngineError> {
        let similar = self
            .provider
            .similar_accounts(identity)
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        info!(identity, suggested = similar.len(), "collected similar accounts");
        self.harvest_accounts(similar).await
    }

    /// Same as [`HarvestEngine::harvest_accounts`] with one handle per line.
    pub async fn harvest_accounts_file(&self, path: &Path) -> Result<BatchReport, EngineError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading handles from {}", path.display()))
            .map_err(EngineError::Input)?;
        self.harvest_accounts(text.lines().map(str::to_string).collect())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_adapters::{
        FailureKind, FixtureFailure, FixtureFeed, FixturePost, FixtureProfile, FixtureProvider,
    };
    use harvest_core::{ProfileSnapshot, ProviderError};
    use harvest_storage::SqliteTier;
    use tempfile::{tempdir, TempDir};

    use crate::checkpoint::CheckpointError;
    use crate::notify::testing::RecordingNotifier;
    use crate::synchronizer::TierKind;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn profile(username: &str) -> FixtureProfile {
        FixtureProfile::Profile(ProfileSnapshot {
            username: username.to_string(),
            media_count: 8,
            followers: 100,
            followees: 50,
            is_private: false,
            biography: String::new(),
            external_url: Some("https://example.com".into()),
            is_verified: false,
        })
    }

    struct Harness {
        dir: TempDir,
        provider: Arc<FixtureProvider>,
        notifier: Arc<RecordingNotifier>,
        engine: HarvestEngine,
    }

    async fn harness(posts: Vec<FixturePost>, write_through: bool) -> Harness {
        let dir = tempdir().expect("tempdir");
        let provider = Arc::new(FixtureProvider::new(FixtureFeed {
            posts,
            ..FixtureFeed::default()
        }));
        for name in ["a", "b", "c", "d", "e"] {
            provider.set_profile(name, profile(name)).await;
        }
        let notifier = Arc::new(RecordingNotifier::default());
        let buffer = Arc::new(TierHandle::new(
            TierKind::Buffer,
            Arc::new(
                SqliteTier::in_memory("buffer", TierKind::Buffer.layout())
                    .await
                    .expect("tier"),
            ),
        ));
        let engine = HarvestEngine::new(EngineParts {
            provider: provider.clone(),
            checkpoint: CheckpointManager::new(dir.path().join("engine.json"), 256),
            log: Arc::new(
                AppendLog::open(dir.path().join("accounts.csv"))
                    .await
                    .expect("log"),
            ),
            buffer,
            notifier: notifier.clone(),
            comment_limit: 20,
            workers: 3,
            write_through,
        });
        Harness {
            dir,
            provider,
            notifier,
            engine,
        }
    }

    #[tokio::test]
    async fn fresh_engine_starts_at_newest_post_and_queues_only_new_ones() {
        let mut h = harness(vec![FixturePost::new("old", at(1), &["a"])], false).await;
        h.engine.load_or_initialize().await.expect("init");
        assert_eq!(h.engine.state().watermark, Some(at(1)));

        assert_eq!(
            h.engine.run_cycle().await.expect("cycle"),
            CycleOutcome::Refilled { added: 0 }
        );

        h.provider.publish(FixturePost::new("p2", at(2), &["a", "b"])).await;
        h.provider.publish(FixturePost::new("p3", at(3), &["c"])).await;
        assert_eq!(
            h.engine.run_cycle().await.expect("cycle"),
            CycleOutcome::Refilled { added: 2 }
        );
        assert_eq!(h.engine.status().queue_head_identity.as_deref(), Some("p3"));
        assert_eq!(h.engine.state().watermark, Some(at(3)));

        match h.engine.run_cycle().await.expect("cycle") {
            CycleOutcome::Extracted(report) => {
                assert_eq!(report.post_id.as_deref(), Some("p3"));
                assert_eq!(report.stored, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(h.notifier.contains("Finished round of data collection").await);

        let snapshot = h.engine.checkpoint().load().await.expect("load").expect("saved");
        assert_eq!(snapshot.queue.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_enters_cooldown_and_blocks_until_reset() {
        let mut post = FixturePost::new("p2", at(2), &["a"]);
        post.comments_failure = Some(FixtureFailure::new(FailureKind::RateLimited));
        let mut h = harness(vec![FixturePost::new("p1", at(1), &[])], false).await;
        h.engine.load_or_initialize().await.expect("init");
        h.provider.publish(post).await;
        h.provider.publish(FixturePost::new("p3", at(3), &["b"])).await;
        h.engine.run_cycle().await.expect("refill");

        // p3 extracts fine; p2 hits the rate limit.
        h.engine.run_cycle().await.expect("p3");
        let outcome = h.engine.run_cycle().await.expect("p2");
        assert!(matches!(outcome, CycleOutcome::EnteredCooldown { .. }));
        assert!(h.engine.status().cooldown);
        assert!(h.notifier.contains("cooling down").await);

        let calls = h.provider.profile_calls();
        h.provider.publish(FixturePost::new("p4", at(4), &["c"])).await;
        assert_eq!(h.engine.run_cycle().await.expect("skip"), CycleOutcome::Skipped);
        assert_eq!(h.engine.run_cycle().await.expect("skip"), CycleOutcome::Skipped);
        assert_eq!(h.provider.profile_calls(), calls);
        let saved = h
            .engine
            .checkpoint()
            .load()
            .await
            .expect("load")
            .expect("saved");
        assert!(saved.cooldown.is_cooling());

        h.engine.reset().await.expect("reset");
        assert!(!h.engine.status().cooldown);
        assert_eq!(h.engine.state().watermark, Some(at(4)));
        assert!(matches!(
            h.engine.run_cycle().await.expect("cycle"),
            CycleOutcome::Refilled { added: 0 }
        ));
    }

    #[tokio::test]
    async fn missing_post_is_skipped_not_fatal() {
        let mut h = harness(vec![FixturePost::new("p1", at(1), &[])], false).await;
        h.engine.load_or_initialize().await.expect("init");
        h.provider.publish(FixturePost::new("p2", at(2), &["a"])).await;
        h.engine.run_cycle().await.expect("refill");

        // The post disappears before its comments are read.
        let mut state = h.engine.state().clone();
        state.queue.push(Post {
            id: "deleted".into(),
            published_at: at(2),
        });
        h.engine.state = state;

        let outcome = h.engine.run_cycle().await.expect("cycle");
        assert!(matches!(outcome, CycleOutcome::ItemSkipped { .. }));
        assert!(!h.engine.status().cooldown);
        assert_eq!(h.engine.status().queue_head_identity.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn unclassified_failure_is_fatal_after_saving() {
        let mut h = harness(vec![FixturePost::new("p1", at(1), &[])], false).await;
        h.engine.load_or_initialize().await.expect("init");
        h.provider
            .set_feed_failure(Some(FixtureFailure::new(FailureKind::Unclassified)))
            .await;

        let err = h.engine.run_cycle().await.expect_err("fatal");
        assert!(matches!(
            err,
            EngineError::Provider(ProviderError::Unclassified(_))
        ));
        assert!(h.notifier.contains("Fatal error").await);
        let saved = h.engine.checkpoint().load().await.expect("load").expect("saved");
        assert!(saved.last_run.is_some());
    }

    #[tokio::test]
    async fn write_through_fills_the_buffer_during_cycles() {
        let mut h = harness(vec![FixturePost::new("p1", at(1), &[])], true).await;
        h.engine.load_or_initialize().await.expect("init");
        h.provider
            .publish(FixturePost::new("p2", at(2), &["a", "b", "ghost"]))
            .await;
        h.engine.run_cycle().await.expect("refill");
        h.engine.run_cycle().await.expect("extract");

        assert_eq!(h.engine.buffer.tier().count().await.expect("count"), 2);
        let scan = AppendLog::scan(h.engine.log().path()).await.expect("scan");
        assert_eq!(scan.records.len(), 2);
    }

    #[tokio::test]
    async fn harvest_accounts_file_dedups_handles() {
        let h = harness(Vec::new(), false).await;
        let path = h.dir.path().join("handles.txt");
        std::fs::write(&path, "a\nb\na\n\nghost\n").expect("write");

        let report = h.engine.harvest_accounts_file(&path).await.expect("harvest");
        assert_eq!(report.stored, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.not_found, vec!["ghost"]);
        assert_eq!(h.engine.buffer.tier().count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn similar_accounts_are_harvested_into_the_buffer() {
        let h = harness(Vec::new(), false).await;
        h.provider.set_similar("a", &["b", "c", "ghost", "b"]).await;

        let report = h.engine.harvest_similar("a").await.expect("harvest");
        assert_eq!(report.stored, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.not_found, vec!["ghost"]);
        assert_eq!(h.engine.buffer.tier().count().await.expect("count"), 2);

        let err = h.engine.harvest_similar("nobody").await.expect_err("unknown");
        assert!(matches!(err, EngineError::Provider(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn reinitialize_replaces_an_incompatible_snapshot() {
        let mut h = harness(vec![FixturePost::new("p1", at(5), &[])], false).await;
        std::fs::write(h.dir.path().join("engine.json"), r#"{"version": 99}"#).expect("seed");

        let err = h.engine.load_or_initialize().await.expect_err("refuse");
        assert!(matches!(
            err,
            EngineError::Checkpoint(CheckpointError::VersionMismatch { found: 99, .. })
        ));

        h.engine.reinitialize().await.expect("reinit");
        assert_eq!(h.engine.state().watermark, Some(at(5)));
        assert!(h.engine.checkpoint().load().await.expect("load").is_some());
    }
}
