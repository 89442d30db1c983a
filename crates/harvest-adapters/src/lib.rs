//! Provider contracts + a fixture-first provider implementation.
//!
//! The real feed/profile client is a black box to the engine: anything that
//! implements [`FeedProvider`] and maps its failures onto [`ProviderError`]
//! classes can drive a harvest.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use harvest_core::{AccountRecord, Post, ProfileSnapshot, ProviderError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Feed posts, newest first. Single pass.
pub type FeedStream = BoxStream<'static, Result<Post, ProviderError>>;

/// Account handles in provider order: the comment authors of one post, or
/// the accounts suggested as similar to one profile. Single pass.
pub type CommentStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait FeedProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn feed(&self) -> Result<FeedStream, ProviderError>;

    async fn comment_authors(&self, post: &Post) -> Result<CommentStream, ProviderError>;

    async fn profile(&self, identity: &str) -> Result<ProfileSnapshot, ProviderError>;

    /// Accounts the provider suggests as similar to `identity`.
    async fn similar_accounts(&self, identity: &str) -> Result<CommentStream, ProviderError>;
}

/// Fetches one account's attribute tuple. Never retries; failures keep their
/// provider classification so the caller can decide.
#[derive(Clone)]
pub struct ProfileExtractor {
    provider: Arc<dyn FeedProvider>,
}

impl ProfileExtractor {
    pub fn new(provider: Arc<dyn FeedProvider>) -> Self {
        Self { provider }
    }

    pub async fn extract(&self, identity: &str) -> Result<AccountRecord, ProviderError> {
        let profile = self.provider.profile(identity).await?;
        debug!(identity, provider = self.provider.provider_id(), "gathered profile");
        Ok(AccountRecord::from(&profile))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    RateLimited,
    ConnectionFailed,
    Unclassified,
}

/// A scripted provider failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureFailure {
    pub kind: FailureKind,
    #[serde(default)]
    pub message: String,
}

impl FixtureFailure {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            kind,
            message: String::new(),
        }
    }

    pub fn to_error(&self, subject: &str) -> ProviderError {
        let detail = if self.message.is_empty() {
            subject.to_string()
        } else {
            format!("{subject}: {}", self.message)
        };
        match self.kind {
            FailureKind::NotFound => ProviderError::NotFound(detail),
            FailureKind::RateLimited => ProviderError::RateLimited(detail),
            FailureKind::ConnectionFailed => ProviderError::ConnectionFailed(detail),
            FailureKind::Unclassified => ProviderError::Unclassified(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePost {
    pub id: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub comment_authors: Vec<String>,
    /// Raised after the listed authors have been yielded.
    #[serde(default)]
    pub comments_failure: Option<FixtureFailure>,
}

impl FixturePost {
    pub fn new(id: &str, published_at: DateTime<Utc>, authors: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            published_at,
            comment_authors: authors.iter().map(|a| a.to_string()).collect(),
            comments_failure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixtureProfile {
    Failure { error: FixtureFailure },
    Profile(ProfileSnapshot),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureFeed {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub posts: Vec<FixturePost>,
    #[serde(default)]
    pub profiles: BTreeMap<String, FixtureProfile>,
    /// Suggested accounts per profile.
    #[serde(default)]
    pub similar_accounts: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub feed_failure: Option<FixtureFailure>,
}

fn default_provider_id() -> String {
    "fixture".to_string()
}

pub fn load_fixture_feed(path: impl AsRef<Path>) -> Result<FixtureFeed> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Provider backed by an in-memory [`FixtureFeed`]. Tests mutate it between
/// cycles to simulate new posts and provider trouble.
#[derive(Debug)]
pub struct FixtureProvider {
    provider_id: String,
    feed: RwLock<FixtureFeed>,
    profile_calls: AtomicUsize,
}

impl FixtureProvider {
    pub fn new(feed: FixtureFeed) -> Self {
        Self {
            provider_id: feed.provider_id.clone(),
            feed: RwLock::new(feed),
            profile_calls: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_feed(path)?))
    }

    pub async fn publish(&self, post: FixturePost) {
        self.feed.write().await.posts.push(post);
    }

    pub async fn set_profile(&self, identity: &str, profile: FixtureProfile) {
        self.feed
            .write()
            .await
            .profiles
            .insert(identity.to_string(), profile);
    }

    pub async fn set_similar(&self, identity: &str, similar: &[&str]) {
        self.feed.write().await.similar_accounts.insert(
            identity.to_string(),
            similar.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub async fn set_feed_failure(&self, failure: Option<FixtureFailure>) {
        self.feed.write().await.feed_failure = failure;
    }

    /// Number of profile lookups served so far, failures included.
    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedProvider for FixtureProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn feed(&self) -> Result<FeedStream, ProviderError> {
        let feed = self.feed.read().await;
        if let Some(failure) = &feed.feed_failure {
            return Err(failure.to_error("feed"));
        }
        let mut posts = feed
            .posts
            .iter()
            .map(|p| Post {
                id: p.id.clone(),
                published_at: p.published_at,
            })
            .collect::<Vec<_>>();
        posts.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(stream::iter(posts.into_iter().map(Ok)).boxed())
    }

    async fn comment_authors(&self, post: &Post) -> Result<CommentStream, ProviderError> {
        let feed = self.feed.read().await;
        let Some(fixture) = feed.posts.iter().find(|p| p.id == post.id) else {
            return Err(ProviderError::NotFound(format!("post {}", post.id)));
        };
        let authors = fixture
            .comment_authors
            .clone()
            .into_iter()
            .map(Ok)
            .collect::<Vec<_>>();
        let tail = fixture
            .comments_failure
            .as_ref()
            .map(|f| Err(f.to_error(&format!("comments of {}", post.id))));
        Ok(stream::iter(authors.into_iter().chain(tail)).boxed())
    }

    async fn profile(&self, identity: &str) -> Result<ProfileSnapshot, ProviderError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        let feed = self.feed.read().await;
        match feed.profiles.get(identity) {
            Some(FixtureProfile::Profile(profile)) => Ok(profile.clone()),
            Some(FixtureProfile::Failure { error }) => Err(error.to_error(identity)),
            None => Err(ProviderError::NotFound(identity.to_string())),
        }
    }

    async fn similar_accounts(&self, identity: &str) -> Result<CommentStream, ProviderError> {
        let feed = self.feed.read().await;
        if let Some(FixtureProfile::Failure { error }) = feed.profiles.get(identity) {
            return Err(error.to_error(identity));
        }
        match feed.similar_accounts.get(identity) {
            Some(similar) => Ok(stream::iter(similar.clone().into_iter().map(Ok)).boxed()),
            None if feed.profiles.contains_key(identity) => Ok(stream::empty().boxed()),
            None => Err(ProviderError::NotFound(format!(
                "similar accounts of {identity}"
            ))),
        }
    }
}
