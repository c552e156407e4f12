use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ServiceError;

/// Top-level indexer configuration. Every key is optional in the TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub queues: QueueConfig,
    pub index: IndexConfig,
    pub store: StoreConfig,
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub build_queue: String,
    pub build_dlq: String,
    pub event_queue: String,
    pub event_dlq: String,
    /// Deliveries before a message is moved to its DLQ.
    pub max_receive_count: u32,
    pub visibility_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            build_queue: "offender-index-queue".into(),
            build_dlq: "offender-index-dlq".into(),
            event_queue: "offender-event-queue".into(),
            event_dlq: "offender-event-dlq".into(),
            max_receive_count: 5,
            visibility_timeout_ms: 30_000,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration { Duration::from_millis(self.visibility_timeout_ms) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Offender ids per populate-page message.
    pub page_size: u64,
    /// Largest tolerated gap between the upstream total and the built index's size.
    pub complete_threshold: u64,
    /// Root of the physical indices; defaults to `indices/` next to the database.
    pub index_dir: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self { Self { page_size: 1000, complete_threshold: 0, index_dir: None } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self { Self { db_path: PathBuf::from("target/indexer/indexer.db") } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub housekeeping_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self { Self { poll_interval_ms: 500, housekeeping_interval_ms: 60_000 } }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
    pub fn housekeeping_interval(&self) -> Duration { Duration::from_millis(self.housekeeping_interval_ms) }
}

impl IndexerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ServiceError> {
        let cfg: IndexerConfig = toml::from_str(raw).map_err(|e| ServiceError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.index.page_size == 0 {
            return Err(ServiceError::Config("index.page_size must be positive".into()));
        }
        if self.queues.max_receive_count == 0 {
            return Err(ServiceError::Config("queues.max_receive_count must be positive".into()));
        }
        let q = &self.queues;
        let names = [&q.build_queue, &q.build_dlq, &q.event_queue, &q.event_dlq];
        for (i, a) in names.iter().enumerate() {
            if a.is_empty() {
                return Err(ServiceError::Config("queue names must not be empty".into()));
            }
            if names[i + 1..].contains(a) {
                return Err(ServiceError::Config(format!("queue name {a} is used twice")));
            }
        }
        Ok(())
    }

    /// Directory holding the physical indices.
    pub fn index_dir(&self) -> PathBuf {
        match &self.index.index_dir {
            Some(d) => d.clone(),
            None => self
                .store
                .db_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
                .join("indices"),
        }
    }
}
