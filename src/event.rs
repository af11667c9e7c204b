//! Mutation event model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    record::EntityRecord,
    types::{EntityId, EntityRef, EntityType, Offset, Operation},
};

/// Version number for serialized [`EventEnvelope`] payloads.
pub const EVENT_FORMAT_VERSION: u16 = 1;

/// Immutable change emitted by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Stream this event belongs to.
    pub entity_type: EntityType,
    /// Mutated record.
    pub entity_id: EntityId,
    /// Position in the entity type's stream. Strictly increasing.
    pub offset: Offset,
    /// Emission time in milliseconds since epoch.
    pub ts_ms: u64,
    /// Kind of mutation.
    pub op: Operation,
    /// Snapshot of the record after the mutation. `None` for deletes.
    pub payload: Option<EntityRecord>,
}

impl MutationEvent {
    /// Builds a create event from a full record snapshot.
    pub fn create(offset: Offset, ts_ms: u64, record: EntityRecord) -> Self {
        Self::with_payload(Operation::Create, offset, ts_ms, record)
    }

    /// Builds an update event from a full record snapshot.
    pub fn update(offset: Offset, ts_ms: u64, record: EntityRecord) -> Self {
        Self::with_payload(Operation::Update, offset, ts_ms, record)
    }

    /// Builds a payload-less delete event.
    pub fn delete(offset: Offset, ts_ms: u64, entity: EntityRef) -> Self {
        Self {
            entity_type: entity.entity_type,
            entity_id: entity.id,
            offset,
            ts_ms,
            op: Operation::Delete,
            payload: None,
        }
    }

    fn with_payload(op: Operation, offset: Offset, ts_ms: u64, record: EntityRecord) -> Self {
        Self {
            entity_type: record.entity_type(),
            entity_id: record.id().to_string(),
            offset,
            ts_ms,
            op,
            payload: Some(record),
        }
    }

    /// Typed pointer to the mutated record.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.clone())
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped event.
    pub event: MutationEvent,
}

impl EventEnvelope {
    /// Constructs an envelope using [`EVENT_FORMAT_VERSION`].
    pub fn new(event: MutationEvent) -> Self {
        Self {
            format_version: EVENT_FORMAT_VERSION,
            event,
        }
    }
}
