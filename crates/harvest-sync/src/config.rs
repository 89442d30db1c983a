use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "HARVEST_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub append_log_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub journal_path: PathBuf,
    pub buffer_url: String,
    pub primary_url: String,
    pub archive_url: String,
    pub feed_fixture_path: PathBuf,
    /// Comment authors pulled per cycle.
    pub comment_limit: usize,
    pub worker_pool_size: usize,
    /// Queue length above which a snapshot keeps only the top post.
    pub snapshot_queue_threshold: usize,
    /// Also upsert each extracted record into the local buffer.
    pub write_through: bool,
    pub cycle_cron: String,
    pub notify_webhook_url: Option<String>,
    pub web_port: u16,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            append_log_path: data_dir.join("accounts.csv"),
            snapshot_path: data_dir.join("engine.json"),
            journal_path: data_dir.join("migrations.json"),
            buffer_url: "sqlite://data/buffer.db".to_string(),
            primary_url: "sqlite://data/primary.db".to_string(),
            archive_url: "sqlite://data/archive.db".to_string(),
            feed_fixture_path: PathBuf::from("./fixtures/feed/sample.json"),
            comment_limit: 20,
            worker_pool_size: 8,
            snapshot_queue_threshold: 256,
            write_through: false,
            cycle_cron: "0 */5 * * * *".to_string(),
            notify_webhook_url: None,
            web_port: 8000,
            data_dir,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let data_dir = env_path("HARVEST_DATA_DIR").unwrap_or(defaults.data_dir);
        Self {
            append_log_path: env_path("HARVEST_APPEND_LOG")
                .unwrap_or_else(|| data_dir.join("accounts.csv")),
            snapshot_path: env_path("HARVEST_SNAPSHOT_PATH")
                .unwrap_or_else(|| data_dir.join("engine.json")),
            journal_path: env_path("HARVEST_JOURNAL_PATH")
                .unwrap_or_else(|| data_dir.join("migrations.json")),
            buffer_url: std::env::var("HARVEST_BUFFER_URL").unwrap_or(defaults.buffer_url),
            primary_url: std::env::var("HARVEST_PRIMARY_URL").unwrap_or(defaults.primary_url),
            archive_url: std::env::var("HARVEST_ARCHIVE_URL").unwrap_or(defaults.archive_url),
            feed_fixture_path: env_path("HARVEST_FEED_FIXTURE")
                .unwrap_or(defaults.feed_fixture_path),
            comment_limit: env_parse("HARVEST_COMMENT_LIMIT").unwrap_or(defaults.comment_limit),
            worker_pool_size: env_parse("HARVEST_WORKERS").unwrap_or(defaults.worker_pool_size),
            snapshot_queue_threshold: env_parse("HARVEST_SNAPSHOT_QUEUE_THRESHOLD")
                .unwrap_or(defaults.snapshot_queue_threshold),
            write_through: std::env::var("HARVEST_WRITE_THROUGH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.write_through),
            cycle_cron: std::env::var("HARVEST_CYCLE_CRON").unwrap_or(defaults.cycle_cron),
            notify_webhook_url: std::env::var("HARVEST_NOTIFY_WEBHOOK").ok(),
            web_port: env_parse("HARVEST_WEB_PORT").unwrap_or(defaults.web_port),
            data_dir,
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// YAML file named by `HARVEST_CONFIG` when set, environment otherwise.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(path),
            _ => Ok(Self::from_env()),
        }
    }

    /// Same settings rooted in another data directory. Used by tests and the CLI.
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let sqlite = |name: &str| format!("sqlite://{}", data_dir.join(name).display());
        Self {
            append_log_path: data_dir.join("accounts.csv"),
            snapshot_path: data_dir.join("engine.json"),
            journal_path: data_dir.join("migrations.json"),
            buffer_url: sqlite("buffer.db"),
            primary_url: sqlite("primary.db"),
            archive_url: sqlite("archive.db"),
            data_dir,
            ..Self::default()
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
