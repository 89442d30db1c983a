use std::path::{Path, PathBuf};

use anyhow::Context;
use harvest_core::{AccountRecord, RecordParseError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum AppendError {
    /// The record would not read back as itself; nothing was written.
    #[error("record cannot be logged: {0}")]
    Unloggable(#[from] RecordParseError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Append-only, newline-delimited record log shared by extraction workers.
///
/// Every record is rendered into one buffer and written under the file lock,
/// so concurrent appenders never interleave partial lines.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    file: Mutex<fs::File>,
}

/// Result of reading an append log back.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    /// Parsed records in file order.
    pub records: Vec<AccountRecord>,
    /// 1-based line numbers that failed to parse.
    pub malformed_lines: Vec<usize>,
}

impl AppendLog {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening append log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &AccountRecord) -> Result<(), AppendError> {
        let mut line = record.to_log_line()?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }

    pub async fn size_bytes(&self) -> anyhow::Result<u64> {
        let meta = fs::metadata(&self.path)
            .await
            .with_context(|| format!("stat {}", self.path.display()))?;
        Ok(meta.len())
    }

    /// Read every line of the log at `path`. Blank lines are ignored; lines
    /// that are not UTF-8 count as malformed.
    pub async fn scan(path: &Path) -> anyhow::Result<LogScan> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading append log {}", path.display()))?;
        let mut scan = LogScan::default();
        for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(line = idx + 1, error = %err, "skipping non-UTF-8 log line");
                    scan.malformed_lines.push(idx + 1);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match AccountRecord::parse_log_line(line) {
                Ok(record) => scan.records.push(record),
                Err(err) => {
                    tracing::warn!(line = idx + 1, error = %err, "skipping malformed log line");
                    scan.malformed_lines.push(idx + 1);
                }
            }
        }
        Ok(scan)
    }
}
