//! Pipeline configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    feed::ReaderOptions,
    index::writer::WriterConfig,
    persist::{CheckpointStore, MemoryCheckpointStore, PersistError, sqlite::SqliteCheckpointStore},
    runtime::backoff::Backoff,
    types::EntityType,
};

/// Configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    /// The config is not valid JSON for [`SyncConfig`].
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for a sync pipeline. Every field has a default, so `{}` is a
/// valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Streams to run a worker for.
    pub entity_types: Vec<EntityType>,
    /// Maximum events per index batch.
    pub batch_max_size: usize,
    /// Longest the writer holds a partial batch.
    pub batch_max_wait_ms: u64,
    /// First retry delay.
    pub retry_base_ms: u64,
    /// Retry delay ceiling.
    pub retry_cap_ms: u64,
    /// SQLite file for checkpoints. `None` keeps them in memory.
    pub checkpoint_store_location: Option<PathBuf>,
    /// Feed polling interval for sources without wake-ups.
    pub poll_interval_ms: u64,
    /// Maximum events per feed fetch.
    pub fetch_limit: usize,
    /// Capacity of the index writer's request queue.
    pub writer_queue_bound: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            entity_types: EntityType::ALL.to_vec(),
            batch_max_size: 64,
            batch_max_wait_ms: 50,
            retry_base_ms: 500,
            retry_cap_ms: 30_000,
            checkpoint_store_location: None,
            poll_interval_ms: 250,
            fetch_limit: 256,
            writer_queue_bound: 64,
        }
    }
}

impl SyncConfig {
    /// Parses and validates a JSON config.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entity_types.is_empty() {
            return Err(ConfigError::Invalid("entity_types must not be empty".to_string()));
        }
        for (i, et) in self.entity_types.iter().enumerate() {
            if self.entity_types[..i].contains(et) {
                return Err(ConfigError::Invalid(format!("entity type {et} listed twice")));
            }
        }
        if self.batch_max_size == 0 {
            return Err(ConfigError::Invalid("batch_max_size must be positive".to_string()));
        }
        if self.fetch_limit == 0 {
            return Err(ConfigError::Invalid("fetch_limit must be positive".to_string()));
        }
        if self.writer_queue_bound == 0 {
            return Err(ConfigError::Invalid("writer_queue_bound must be positive".to_string()));
        }
        if self.retry_base_ms == 0 {
            return Err(ConfigError::Invalid("retry_base_ms must be positive".to_string()));
        }
        if self.retry_cap_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_cap_ms ({}) is below retry_base_ms ({})",
                self.retry_cap_ms, self.retry_base_ms
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_cap_ms),
        )
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_max_size: self.batch_max_size,
            batch_max_wait: Duration::from_millis(self.batch_max_wait_ms),
            queue_bound: self.writer_queue_bound,
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            fetch_limit: self.fetch_limit,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Opens the checkpoint store named by `checkpoint_store_location`.
    pub fn open_checkpoint_store(&self) -> Result<Box<dyn CheckpointStore>, PersistError> {
        match &self.checkpoint_store_location {
            Some(path) => Ok(Box::new(SqliteCheckpointStore::open(path)?)),
            None => Ok(Box::new(MemoryCheckpointStore::new())),
        }
    }
}
