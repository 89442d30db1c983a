//! Bounded concurrent profile extraction for one post's comment batch.

use std::slice;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use harvest_adapters::{CommentStream, ProfileExtractor};
use harvest_core::{AccountRecord, DedupIndex, Post, ProviderError};
use harvest_storage::{AppendLog, WriteSemantics};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::synchronizer::TierHandle;

/// Where completed records go. Each worker writes its own record as soon as
/// its extraction finishes.
#[derive(Clone, Default)]
pub struct RecordSink {
    log: Option<Arc<AppendLog>>,
    buffer: Option<Arc<TierHandle>>,
}

impl RecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: Arc<AppendLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_buffer(mut self, buffer: Arc<TierHandle>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    async fn accept(&self, record: &AccountRecord) -> Result<(), EngineError> {
        if let Some(log) = &self.log {
            log.append(record).await?;
        }
        if let Some(buffer) = &self.buffer {
            let _guard = buffer.lock().await;
            buffer
                .tier()
                .write_batch(slice::from_ref(record), WriteSemantics::Upsert)
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub post_id: Option<String>,
    /// Items taken from the comment stream, duplicates included.
    pub pulled: usize,
    pub submitted: usize,
    pub stored: usize,
    pub not_found: Vec<String>,
    /// Extracted, but the append log cannot represent the identity.
    pub rejected: Vec<String>,
    pub duplicates: usize,
    /// The stream ended before the limit was reached.
    pub exhausted: bool,
    pub elapsed_ms: u64,
}

/// A finished batch plus the most severe non-swallowed failure, if any.
#[derive(Debug)]
pub struct BatchOutcome {
    pub report: BatchReport,
    pub failure: Option<EngineError>,
}

enum TaskOutcome {
    Stored,
    NotFound(String),
    Rejected(String),
}

#[derive(Clone)]
pub struct ExtractionPool {
    extractor: ProfileExtractor,
    workers: usize,
}

impl ExtractionPool {
    pub fn new(extractor: ProfileExtractor, workers: usize) -> Self {
        Self {
            extractor,
            workers: workers.max(1),
        }
    }

    /// Pull up to `limit` comment authors of `post` and extract each distinct
    /// one. Every pulled author is submitted right away; at most `workers`
    /// extractions run at once. Records land in the sink in completion order.
    pub async fn extract_comments(
        &self,
        post: &Post,
        mut authors: CommentStream,
        limit: usize,
        sink: &RecordSink,
    ) -> BatchOutcome {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut seen = DedupIndex::new();
        let mut report = BatchReport {
            post_id: Some(post.id.clone()),
            ..BatchReport::default()
        };
        let mut failure = None;

        while report.pulled < limit {
            match authors.next().await {
                Some(Ok(identity)) => {
                    report.pulled += 1;
                    if !seen.insert(&identity) {
                        report.duplicates += 1;
                        continue;
                    }
                    report.submitted += 1;
                    self.spawn(&mut tasks, &permits, identity, sink.clone());
                }
                Some(Err(err)) => {
                    warn!(post_id = %post.id, error = %err, "comment stream failed");
                    failure = EngineError::worst(failure, err.into());
                    break;
                }
                None => {
                    report.exhausted = true;
                    break;
                }
            }
        }

        let failure = drain(&mut tasks, &mut report, failure).await;
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            post_id = %post.id,
            pulled = report.pulled,
            stored = report.stored,
            not_found = report.not_found.len(),
            exhausted = report.exhausted,
            elapsed_ms = report.elapsed_ms,
            "comment batch finished"
        );
        BatchOutcome { report, failure }
    }

    /// Extract an explicit list of handles, skipping repeats.
    pub async fn extract_identities(
        &self,
        identities: Vec<String>,
        sink: &RecordSink,
    ) -> BatchOutcome {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut seen = DedupIndex::new();
        let mut report = BatchReport::default();

        for identity in identities {
            let identity = identity.trim().to_string();
            if identity.is_empty() {
                continue;
            }
            report.pulled += 1;
            if !seen.insert(&identity) {
                report.duplicates += 1;
                continue;
            }
            report.submitted += 1;
            self.spawn(&mut tasks, &permits, identity, sink.clone());
        }
        report.exhausted = true;

        let failure = drain(&mut tasks, &mut report, None).await;
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            submitted = report.submitted,
            stored = report.stored,
            not_found = report.not_found.len(),
            elapsed_ms = report.elapsed_ms,
            "account batch finished"
        );
        BatchOutcome { report, failure }
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<Result<TaskOutcome, EngineError>>,
        permits: &Arc<Semaphore>,
        identity: String,
        sink: RecordSink,
    ) {
        let extractor = self.extractor.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Worker(e.to_string()))?;
            match extractor.extract(&identity).await {
                Ok(record) => match sink.accept(&record).await {
                    Ok(()) => {
                        debug!(identity = %identity, "stored account record");
                        Ok(TaskOutcome::Stored)
                    }
                    Err(EngineError::Unloggable(err)) => {
                        warn!(identity = %identity, error = %err, "record not loggable, skipping");
                        Ok(TaskOutcome::Rejected(identity))
                    }
                    Err(err) => Err(err),
                },
                Err(ProviderError::NotFound(detail)) => {
                    info!(identity = %identity, detail = %detail, "account unavailable, skipping");
                    Ok(TaskOutcome::NotFound(identity))
                }
                Err(err) => {
                    warn!(identity = %identity, error = %err, "profile extraction failed");
                    Err(err.into())
                }
            }
        });
    }
}

async fn drain(
    tasks: &mut JoinSet<Result<TaskOutcome, EngineError>>,
    report: &mut BatchReport,
    mut failure: Option<EngineError>,
) -> Option<EngineError> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(TaskOutcome::Stored)) => report.stored += 1,
            Ok(Ok(TaskOutcome::NotFound(identity))) => report.not_found.push(identity),
            Ok(Ok(TaskOutcome::Rejected(identity))) => report.rejected.push(identity),
            Ok(Err(err)) => failure = EngineError::worst(failure, err),
            Err(join_err) => {
                failure = EngineError::worst(failure, EngineError::Worker(join_err.to_string()))
            }
        }
    }
    report.not_found.sort();
    report.rejected.sort();
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use harvest_adapters::{
        FailureKind, FeedProvider, FixtureFailure, FixtureFeed, FixturePost, FixtureProfile,
        FixtureProvider,
    };
    use harvest_core::ProfileSnapshot;
    use harvest_storage::{SqliteTier, TierLayout};
    use tempfile::tempdir;

    use crate::synchronizer::TierKind;

    fn profile(username: &str, followers: u64) -> FixtureProfile {
        FixtureProfile::Profile(ProfileSnapshot {
            username: username.to_string(),
            media_count: 12,
            followers,
            followees: 80,
            is_private: false,
            biography: format!("hi@{username}.example"),
            external_url: None,
            is_verified: false,
        })
    }

    fn post(authors: &[&str]) -> (Post, FixturePost) {
        let published_at = Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        (
            Post {
                id: "p1".into(),
                published_at,
            },
            FixturePost::new("p1", published_at, authors),
        )
    }

    async fn provider_with(fixture: FixturePost, found: &[&str]) -> Arc<FixtureProvider> {
        let provider = Arc::new(FixtureProvider::new(FixtureFeed {
            posts: vec![fixture],
            ..FixtureFeed::default()
        }));
        for (i, name) in found.iter().enumerate() {
            provider.set_profile(name, profile(name, i as u64 * 10)).await;
        }
        provider
    }

    #[tokio::test]
    async fn not_found_authors_are_skipped_without_affecting_siblings() {
        let dir = tempdir().expect("tempdir");
        let (post, fixture) = post(&["a", "gone1", "b", "gone2", "c"]);
        let provider = provider_with(fixture, &["a", "b", "c"]).await;
        let log = Arc::new(
            AppendLog::open(dir.path().join("accounts.csv"))
                .await
                .expect("log"),
        );
        let pool = ExtractionPool::new(ProfileExtractor::new(provider.clone()), 2);

        let authors = provider.comment_authors(&post).await.expect("comments");
        let outcome = pool
            .extract_comments(&post, authors, 5, &RecordSink::new().with_log(log.clone()))
            .await;

        assert!(outcome.failure.is_none());
        assert_eq!(outcome.report.stored, 3);
        assert_eq!(outcome.report.not_found, vec!["gone1", "gone2"]);
        assert!(!outcome.report.exhausted);

        let scan = AppendLog::scan(log.path()).await.expect("scan");
        assert!(scan.malformed_lines.is_empty());
        let mut names = scan
            .records
            .iter()
            .map(|r| r.identity.as_str())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn unloggable_identity_is_rejected_without_failing_the_batch() {
        let dir = tempdir().expect("tempdir");
        let (post, fixture) = post(&["a", "evil,1"]);
        let provider = provider_with(fixture, &["a", "evil,1"]).await;
        let log = Arc::new(AppendLog::open(dir.path().join("log.csv")).await.expect("log"));
        let pool = ExtractionPool::new(ProfileExtractor::new(provider.clone()), 2);

        let outcome = pool
            .extract_comments(
                &post,
                provider.comment_authors(&post).await.expect("c"),
                5,
                &RecordSink::new().with_log(log.clone()),
            )
            .await;

        assert!(outcome.failure.is_none());
        assert_eq!(outcome.report.stored, 1);
        assert_eq!(outcome.report.rejected, vec!["evil,1"]);
        let scan = AppendLog::scan(log.path()).await.expect("scan");
        assert_eq!(scan.records.len(), 1);
        assert!(scan.malformed_lines.is_empty());
    }

    #[tokio::test]
    async fn limit_caps_pulls_and_early_exhaustion_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let (post, fixture) = post(&["a", "a", "b"]);
        let provider = provider_with(fixture, &["a", "b"]).await;
        let log = Arc::new(AppendLog::open(dir.path().join("log.csv")).await.expect("log"));
        let pool = ExtractionPool::new(ProfileExtractor::new(provider.clone()), 4);
        let sink = RecordSink::new().with_log(log);

        let capped = pool
            .extract_comments(&post, provider.comment_authors(&post).await.expect("c"), 2, &sink)
            .await;
        assert_eq!(capped.report.pulled, 2);
        assert_eq!(capped.report.duplicates, 1);
        assert_eq!(capped.report.stored, 1);

        let drained = pool
            .extract_comments(&post, provider.comment_authors(&post).await.expect("c"), 20, &sink)
            .await;
        assert!(drained.failure.is_none());
        assert!(drained.report.exhausted);
        assert_eq!(drained.report.pulled, 3);
        assert_eq!(drained.report.stored, 2);
    }

    #[tokio::test]
    async fn transient_failure_is_reported_after_in_flight_work_finishes() {
        let dir = tempdir().expect("tempdir");
        let (post, fixture) = post(&["a", "limited", "b"]);
        let provider = provider_with(fixture, &["a", "b"]).await;
        provider
            .set_profile(
                "limited",
                FixtureProfile::Failure {
                    error: FixtureFailure::new(FailureKind::RateLimited),
                },
            )
            .await;
        let log = Arc::new(AppendLog::open(dir.path().join("log.csv")).await.expect("log"));
        let pool = ExtractionPool::new(ProfileExtractor::new(provider.clone()), 1);

        let outcome = pool
            .extract_comments(
                &post,
                provider.comment_authors(&post).await.expect("c"),
                3,
                &RecordSink::new().with_log(log),
            )
            .await;

        assert!(matches!(
            outcome.failure,
            Some(EngineError::Provider(ProviderError::RateLimited(_)))
        ));
        assert_eq!(outcome.report.stored, 2);
    }

    #[tokio::test]
    async fn write_through_upserts_into_the_buffer() {
        let (_, fixture) = post(&[]);
        let provider = provider_with(fixture, &["a", "b"]).await;
        let buffer = Arc::new(TierHandle::new(
            TierKind::Buffer,
            Arc::new(
                SqliteTier::in_memory("buffer", TierLayout::Keyed)
                    .await
                    .expect("tier"),
            ),
        ));
        let pool = ExtractionPool::new(ProfileExtractor::new(provider), 2);

        let outcome = pool
            .extract_identities(
                vec!["a".into(), "b".into(), "a".into(), "ghost".into(), " ".into()],
                &RecordSink::new().with_buffer(buffer.clone()),
            )
            .await;

        assert!(outcome.failure.is_none());
        assert_eq!(outcome.report.duplicates, 1);
        assert_eq!(outcome.report.not_found, vec!["ghost"]);
        assert_eq!(buffer.tier().count().await.expect("count"), 2);
    }
}
