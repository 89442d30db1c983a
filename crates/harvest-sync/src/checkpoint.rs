//! Versioned, checksummed engine snapshots.
//!
//! On disk a snapshot is a JSON envelope `{version, sha256, payload}` where
//! `payload` is the serialized [`EngineSnapshot`] and `sha256` is the hex
//! digest of the payload text. Loading reads the version before touching the
//! payload so an incompatible schema is rejected instead of misread.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use harvest_storage::SnapshotFile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::cooldown::Cooldown;
use crate::queue::TraversalQueue;
use crate::state::{EngineState, EngineStatus};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("snapshot version {found} is not supported (expected {expected}); reinitialize the engine")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("snapshot {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub saved_at: DateTime<Utc>,
    /// Bottom to top.
    pub queue: TraversalQueue,
    pub watermark: Option<DateTime<Utc>>,
    pub cooldown: Cooldown,
    pub last_run: Option<DateTime<Utc>>,
    pub queue_head_identity: Option<String>,
}

impl EngineSnapshot {
    pub fn capture(state: &EngineState) -> Self {
        Self {
            saved_at: Utc::now(),
            queue: state.queue.clone(),
            watermark: state.watermark,
            cooldown: state.cooldown,
            last_run: state.last_run,
            queue_head_identity: state.queue_head_identity(),
        }
    }

    pub fn into_state(self) -> EngineState {
        EngineState {
            queue: self.queue,
            watermark: self.watermark,
            cooldown: self.cooldown,
            last_run: self.last_run,
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            initialized: true,
            cooldown: self.cooldown.is_cooling(),
            watermark: self.watermark,
            queue_head_identity: self.queue_head_identity.clone(),
            queue_len: self.queue.len(),
            last_run: self.last_run,
            saved_at: Some(self.saved_at),
            scheduled: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionHeader {
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    sha256: String,
    payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    /// Queue length before compaction, when compaction happened.
    pub compacted_from: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    file: SnapshotFile,
    max_queue: usize,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, max_queue: usize) -> Self {
        Self {
            file: SnapshotFile::new(path),
            max_queue: max_queue.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Atomically replace the snapshot. A queue longer than the compaction
    /// threshold is cut down to its top entry first, in the live state too;
    /// the discarded posts are never processed.
    pub async fn save(&self, state: &mut EngineState) -> Result<SaveReport, CheckpointError> {
        let mut report = SaveReport {
            compacted_from: None,
        };
        let len = state.queue.len();
        if len > self.max_queue {
            let discarded = state.queue.keep_top();
            warn!(
                queue_len = len,
                discarded,
                threshold = self.max_queue,
                "compacted traversal queue before snapshot"
            );
            report.compacted_from = Some(len);
        }

        let snapshot = EngineSnapshot::capture(state);
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| anyhow::anyhow!("serializing engine snapshot: {e}"))?;
        let envelope = Envelope {
            version: SNAPSHOT_VERSION,
            sha256: digest(&payload),
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| anyhow::anyhow!("serializing snapshot envelope: {e}"))?;
        self.file.write(&bytes).await?;
        info!(
            path = %self.file.path().display(),
            queue_len = snapshot.queue.len(),
            "saved engine snapshot"
        );
        Ok(report)
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub async fn load_snapshot(&self) -> Result<Option<EngineSnapshot>, CheckpointError> {
        let Some(bytes) = self.file.read().await? else {
            return Ok(None);
        };

        let header: VersionHeader =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;
        if header.version != SNAPSHOT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: header.version,
                expected: SNAPSHOT_VERSION,
            });
        }

        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;
        if digest(&envelope.payload) != envelope.sha256 {
            return Err(self.corrupt("checksum mismatch".to_string()));
        }
        let snapshot =
            serde_json::from_str(&envelope.payload).map_err(|e| self.corrupt(e.to_string()))?;
        Ok(Some(snapshot))
    }

    pub async fn load(&self) -> Result<Option<EngineState>, CheckpointError> {
        Ok(self.load_snapshot().await?.map(EngineSnapshot::into_state))
    }

    fn corrupt(&self, reason: String) -> CheckpointError {
        CheckpointError::Corrupt {
            path: self.file.path().to_path_buf(),
            reason,
        }
    }
}

fn digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}
