//! Post traversal queue and watermark-bounded refill.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use harvest_adapters::FeedStream;
use harvest_core::{Post, ProviderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("traversal queue is empty")]
    EmptyQueue,
}

/// LIFO queue of posts awaiting comment extraction. The last element is the top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraversalQueue {
    posts: Vec<Post>,
}

impl TraversalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from posts listed bottom to top.
    pub fn from_bottom_up(posts: Vec<Post>) -> Self {
        Self { posts }
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn peek(&self) -> Option<&Post> {
        self.posts.last()
    }

    pub fn push(&mut self, post: Post) {
        self.posts.push(post);
    }

    /// Callers check [`TraversalQueue::is_empty`] first.
    pub fn pop(&mut self) -> Result<Post, QueueError> {
        self.posts.pop().ok_or(QueueError::EmptyQueue)
    }

    /// Posts from bottom to top.
    pub fn as_slice(&self) -> &[Post] {
        &self.posts
    }

    /// Drop everything but the top entry. Returns how many posts were discarded.
    pub fn keep_top(&mut self) -> usize {
        let discarded = self.posts.len().saturating_sub(1);
        if discarded > 0 {
            self.posts.drain(..discarded);
        }
        discarded
    }

    /// Push posts given newest first so the newest ends on top, then raise the
    /// watermark to the top's timestamp. Returns how many posts were pushed.
    pub fn refill(
        &mut self,
        unseen_newest_first: Vec<Post>,
        watermark: &mut Option<DateTime<Utc>>,
    ) -> usize {
        let added = unseen_newest_first.len();
        for post in unseen_newest_first.into_iter().rev() {
            self.push(post);
        }
        if added > 0 {
            if let Some(top) = self.peek() {
                *watermark = Some(match *watermark {
                    Some(current) => current.max(top.published_at),
                    None => top.published_at,
                });
            }
        }
        added
    }
}

/// Whether a post published at `published_at` lies beyond the watermark.
pub fn is_unseen(watermark: Option<DateTime<Utc>>, published_at: DateTime<Utc>) -> bool {
    match watermark {
        Some(mark) => published_at > mark,
        None => true,
    }
}

/// Walk a newest-first feed and collect the posts strictly newer than the
/// watermark, stopping at the first one that is not.
pub async fn collect_unseen(
    mut feed: FeedStream,
    watermark: Option<DateTime<Utc>>,
) -> Result<Vec<Post>, ProviderError> {
    let mut unseen = Vec::new();
    while let Some(post) = feed.next().await {
        let post = post?;
        if !is_unseen(watermark, post.published_at) {
            break;
        }
        unseen.push(post);
    }
    Ok(unseen)
}
