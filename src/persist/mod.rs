pub mod sqlite;

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::types::{EntityType, Offset};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl From<crate::core::store::StoreError> for PersistError {
    fn from(value: crate::core::store::StoreError) -> Self {
        Self::Message(format!("store error: {value}"))
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Durable per-entity-type checkpoint storage.
///
/// `save` must not return before the value is durable.
pub trait CheckpointStore: Send {
    fn load(&mut self, entity_type: EntityType) -> PersistResult<Option<Offset>>;
    fn save(&mut self, entity_type: EntityType, offset: Offset) -> PersistResult<()>;
}

/// Process-local checkpoint store. Clones share the same values, which lets
/// a test "restart" a pipeline against the checkpoints of a previous run.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<HashMap<EntityType, Offset>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_type: EntityType) -> Option<Offset> {
        self.inner.lock().get(&entity_type).copied()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&mut self, entity_type: EntityType) -> PersistResult<Option<Offset>> {
        Ok(self.get(entity_type))
    }

    fn save(&mut self, entity_type: EntityType, offset: Offset) -> PersistResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.entry(entity_type).or_insert(offset);
        *slot = (*slot).max(offset);
        Ok(())
    }
}
