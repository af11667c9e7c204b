//! Projection of mutation events into search documents.

/// Per-entity-type mapping functions.
pub mod mapping;
/// Related-record lookup and snapshot.
pub mod related;

use crate::{
    document::{DocKey, DocumentBody, SearchDocument},
    event::MutationEvent,
    record::EntityRecord,
    types::{EntityId, EntityType, Offset, Operation},
};

use self::related::RelatedEntitySnapshot;

/// Result of projecting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Replace the whole document.
    Upsert(SearchDocument),
    /// Remove the document.
    Tombstone(DocKey),
}

impl Projection {
    /// Address of the affected document.
    pub fn key(&self) -> &DocKey {
        match self {
            Projection::Upsert(doc) => &doc.key,
            Projection::Tombstone(key) => key,
        }
    }
}

/// Malformed events. Permanent: retrying the same event cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectorError {
    /// A create/update event without a record snapshot.
    #[error("{entity_type} event at offset {offset} has no payload")]
    MissingPayload {
        /// Stream of the event.
        entity_type: EntityType,
        /// Offset of the event.
        offset: Offset,
    },
    /// The payload's type or id disagrees with the event header.
    #[error("payload {found} does not match event {expected}")]
    PayloadMismatch {
        /// `type/id` from the event header.
        expected: String,
        /// `type/id` from the payload.
        found: String,
    },
    /// Empty entity id.
    #[error("{0} event has an empty entity id")]
    EmptyId(EntityType),
    /// Message without a room reference.
    #[error("message {0} has no room")]
    MissingRoom(EntityId),
}

/// Stateless projector. Same event plus same snapshot always yields the same
/// document.
#[derive(Debug, Clone, Copy, Default)]
pub struct Projector;

impl Projector {
    /// Creates a projector.
    pub fn new() -> Self {
        Self
    }

    /// Projects `event`, embedding the summaries in `related`.
    pub fn project(
        &self,
        event: &MutationEvent,
        related: &RelatedEntitySnapshot,
    ) -> Result<Projection, ProjectorError> {
        if event.entity_id.is_empty() {
            return Err(ProjectorError::EmptyId(event.entity_type));
        }

        let key = DocKey::new(event.entity_type, event.entity_id.clone());
        if event.op == Operation::Delete {
            return Ok(Projection::Tombstone(key));
        }

        let payload = event.payload.as_ref().ok_or(ProjectorError::MissingPayload {
            entity_type: event.entity_type,
            offset: event.offset,
        })?;

        if payload.entity_type() != event.entity_type || payload.id() != event.entity_id {
            return Err(ProjectorError::PayloadMismatch {
                expected: event.entity_ref().to_string(),
                found: payload.entity_ref().to_string(),
            });
        }

        let body = match payload {
            EntityRecord::Message(m) => {
                if m.room_id.is_empty() {
                    return Err(ProjectorError::MissingRoom(m.id.clone()));
                }
                DocumentBody::Message(mapping::message_document(m, related))
            }
            EntityRecord::Room(r) => DocumentBody::Room(mapping::room_document(r, related)),
            EntityRecord::Contact(c) => DocumentBody::Contact(mapping::contact_document(c)),
            EntityRecord::User(u) => DocumentBody::User(mapping::user_document(u)),
        };

        Ok(Projection::Upsert(SearchDocument { key, body }))
    }
}
