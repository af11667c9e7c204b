//! Durable per-entity-type checkpoints.

use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    persist::{CheckpointStore, PersistError},
    types::{EntityType, Offset},
};

/// Checkpoint failures.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The backing store failed. The in-memory checkpoint did not move.
    #[error("checkpoint persistence failed: {0}")]
    Persist(#[from] PersistError),
    /// Advancing past an event that was never read.
    #[error("{entity_type} checkpoint {offset} is ahead of the last read offset {seen}")]
    AheadOfFeed {
        /// Stream being advanced.
        entity_type: EntityType,
        /// Requested checkpoint.
        offset: Offset,
        /// Highest offset observed from the feed.
        seen: Offset,
    },
    /// The blocking persistence task died.
    #[error("checkpoint task failed: {0}")]
    Join(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    applied: Offset,
    seen: Offset,
}

/// Tracks, per entity type, the highest offset whose effects are in the
/// index, and keeps it durable.
///
/// The checkpoint never decreases and never passes an offset that has not
/// been observed from the feed.
pub struct ConsistencyTracker {
    store: Arc<Mutex<Box<dyn CheckpointStore>>>,
    cursors: parking_lot::Mutex<HashMap<EntityType, Cursor>>,
}

impl ConsistencyTracker {
    pub fn new(store: Box<dyn CheckpointStore>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            cursors: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Loads the durable checkpoint for `entity_type`, 0 when none exists,
    /// and primes the cache with it.
    pub async fn load(&self, entity_type: EntityType) -> Result<Offset, CheckpointError> {
        let store = Arc::clone(&self.store);
        let loaded = tokio::task::spawn_blocking(move || store.blocking_lock().load(entity_type))
            .await
            .map_err(|e| CheckpointError::Join(e.to_string()))??
            .unwrap_or(0);

        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(entity_type).or_default();
        cursor.applied = cursor.applied.max(loaded);
        cursor.seen = cursor.seen.max(loaded);
        Ok(cursor.applied)
    }

    /// Records that `offset` was read from the feed.
    pub fn observe(&self, entity_type: EntityType, offset: Offset) {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(entity_type).or_default();
        cursor.seen = cursor.seen.max(offset);
    }

    /// Moves the checkpoint to `offset` once it is durable.
    ///
    /// Offsets at or below the current checkpoint are a no-op. Returns the
    /// checkpoint after the call.
    pub async fn advance(&self, entity_type: EntityType, offset: Offset) -> Result<Offset, CheckpointError> {
        let cursor = self.cursor(entity_type);
        if offset <= cursor.applied {
            return Ok(cursor.applied);
        }
        if offset > cursor.seen {
            return Err(CheckpointError::AheadOfFeed {
                entity_type,
                offset,
                seen: cursor.seen,
            });
        }

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.blocking_lock().save(entity_type, offset))
            .await
            .map_err(|e| CheckpointError::Join(e.to_string()))??;

        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(entity_type).or_default();
        cursor.applied = cursor.applied.max(offset);
        debug!(entity_type = %entity_type, offset = cursor.applied, "checkpoint advanced");
        Ok(cursor.applied)
    }

    /// Current checkpoint for `entity_type`, 0 before anything was loaded or
    /// applied.
    pub fn checkpoint(&self, entity_type: EntityType) -> Offset {
        self.cursor(entity_type).applied
    }

    fn cursor(&self, entity_type: EntityType) -> Cursor {
        self.cursors.lock().get(&entity_type).copied().unwrap_or_default()
    }
}
