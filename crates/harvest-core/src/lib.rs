//! Core domain model for the commenter harvest pipeline.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Character whose presence in a biography marks it as carrying contact details.
pub const CONTACT_MARKER: char = '@';

/// Number of comma-delimited fields in one append-log line.
pub const LOG_FIELD_COUNT: usize = 8;

/// Per-account attribute tuple. `identity` is the natural key in every tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub identity: String,
    pub post_count: u64,
    pub follower_count: u64,
    pub following_count: u64,
    pub is_private: bool,
    pub bio_has_contact_marker: bool,
    pub has_external_link: bool,
    pub is_verified: bool,
}

/// Profile as reported by the provider, before reduction to an [`AccountRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub username: String,
    #[serde(default)]
    pub media_count: u64,
    #[serde(default)]
    pub followers: u64,
    #[serde(default)]
    pub followees: u64,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub biography: String,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
}

impl From<&ProfileSnapshot> for AccountRecord {
    fn from(profile: &ProfileSnapshot) -> Self {
        Self {
            identity: profile.username.clone(),
            post_count: profile.media_count,
            follower_count: profile.followers,
            following_count: profile.followees,
            is_private: profile.is_private,
            bio_has_contact_marker: profile.biography.contains(CONTACT_MARKER),
            has_external_link: profile
                .external_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty()),
            is_verified: profile.is_verified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("identity field is empty")]
    EmptyIdentity,
    #[error("field {field} is not a count: {value:?}")]
    Count { field: &'static str, value: String },
    #[error("field {field} is not a 0/1 flag: {value:?}")]
    Flag { field: &'static str, value: String },
    #[error("identity {0:?} cannot be written as a log field")]
    UnloggableIdentity(String),
}

impl AccountRecord {
    /// Render the record as one append-log line, without the trailing newline.
    ///
    /// Field order: identity, post_count, follower_count, following_count,
    /// is_private, bio_has_contact_marker, has_external_link, is_verified.
    /// Identities that would not parse back unchanged are refused.
    pub fn to_log_line(&self) -> Result<String, RecordParseError> {
        let identity = self.identity.as_str();
        if identity.is_empty() {
            return Err(RecordParseError::EmptyIdentity);
        }
        if identity.contains([',', '\n', '\r']) || identity.trim() != identity {
            return Err(RecordParseError::UnloggableIdentity(identity.to_string()));
        }
        Ok(format!(
            "{},{},{},{},{},{},{},{}",
            self.identity,
            self.post_count,
            self.follower_count,
            self.following_count,
            flag(self.is_private),
            flag(self.bio_has_contact_marker),
            flag(self.has_external_link),
            flag(self.is_verified),
        ))
    }

    pub fn parse_log_line(line: &str) -> Result<Self, RecordParseError> {
        let fields = line
            .trim_end_matches(['\r', '\n'])
            .split(',')
            .map(str::trim)
            .collect::<Vec<_>>();
        if fields.len() != LOG_FIELD_COUNT {
            return Err(RecordParseError::FieldCount {
                expected: LOG_FIELD_COUNT,
                found: fields.len(),
            });
        }
        if fields[0].is_empty() {
            return Err(RecordParseError::EmptyIdentity);
        }

        Ok(Self {
            identity: fields[0].to_string(),
            post_count: parse_count("post_count", fields[1])?,
            follower_count: parse_count("follower_count", fields[2])?,
            following_count: parse_count("following_count", fields[3])?,
            is_private: parse_flag("is_private", fields[4])?,
            bio_has_contact_marker: parse_flag("bio_has_contact_marker", fields[5])?,
            has_external_link: parse_flag("has_external_link", fields[6])?,
            is_verified: parse_flag("is_verified", fields[7])?,
        })
    }
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

fn parse_count(field: &'static str, value: &str) -> Result<u64, RecordParseError> {
    value.parse().map_err(|_| RecordParseError::Count {
        field,
        value: value.to_string(),
    })
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, RecordParseError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(RecordParseError::Flag {
            field,
            value: value.to_string(),
        }),
    }
}

/// A feed post. Its comments are fetched lazily from the provider by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub published_at: DateTime<Utc>,
}

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorClass {
    /// One item is unavailable; skip it and keep going.
    PerItem,
    /// Provider-side pressure; suspend until an operator resets.
    Transient,
    /// Anything else; persist what we can and stop.
    Fatal,
}

/// Failures raised by the feed/profile provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("unclassified provider error: {0}")]
    Unclassified(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::PerItem,
            Self::RateLimited(_) | Self::ConnectionFailed(_) => ErrorClass::Transient,
            Self::Unclassified(_) => ErrorClass::Fatal,
        }
    }
}

/// Identities already seen during one batch or file pass.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    seen: HashSet<String>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time an identity is offered.
    pub fn insert(&mut self, identity: &str) -> bool {
        if self.seen.contains(identity) {
            return false;
        }
        self.seen.insert(identity.to_string())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.seen.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
