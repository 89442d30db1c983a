use harvest_core::{ErrorClass, ProviderError, RecordParseError};
use harvest_storage::{AppendError, StorageError};
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::queue::QueueError;

/// Failures surfaced by one engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("append log: {0:#}")]
    Log(anyhow::Error),
    /// The record cannot be represented in the append log.
    #[error(transparent)]
    Unloggable(RecordParseError),
    #[error("{0:#}")]
    Input(anyhow::Error),
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// How the cooldown machine must react. Only provider failures can be
    /// transient; an unloggable record is skipped; everything else stops the
    /// engine.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Provider(err) => err.class(),
            Self::Unloggable(_) => ErrorClass::PerItem,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn severity(&self) -> u8 {
        match self.class() {
            ErrorClass::PerItem => 0,
            ErrorClass::Transient => 1,
            ErrorClass::Fatal => 2,
        }
    }

    /// Keep whichever of two failures is more severe; ties keep the first.
    pub fn worst(current: Option<Self>, candidate: Self) -> Option<Self> {
        match current {
            Some(existing) if existing.severity() >= candidate.severity() => Some(existing),
            _ => Some(candidate),
        }
    }
}

impl From<AppendError> for EngineError {
    fn from(err: AppendError) -> Self {
        match err {
            AppendError::Unloggable(err) => Self::Unloggable(err),
            AppendError::Io(err) => Self::Log(err),
        }
    }
}

/// Failures of the tier synchronizer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("migration journal: {0:#}")]
    Journal(anyhow::Error),
    #[error("append log: {0:#}")]
    Log(anyhow::Error),
    #[error("source and destination are the same tier ({0})")]
    SameTier(&'static str),
}
