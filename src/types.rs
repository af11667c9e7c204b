//! Shared primitive IDs and entity-type enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Monotonic change offset, scoped to one entity type.
pub type Offset = u64;
/// Stable entity identifier.
pub type EntityId = String;

/// Category of record tracked by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Chat room.
    Room,
    /// Message inside a room.
    Message,
    /// External contact talking to an agent.
    Contact,
    /// Agent account.
    User,
}

impl EntityType {
    /// Every entity type, in stream order.
    pub const ALL: [EntityType; 4] = [
        EntityType::Room,
        EntityType::Message,
        EntityType::Contact,
        EntityType::User,
    ];

    /// Stable lowercase name used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Room => "room",
            EntityType::Message => "message",
            EntityType::Contact => "contact",
            EntityType::User => "user",
        }
    }

    /// Name of the search index holding documents of this type.
    pub fn index_name(&self) -> &'static str {
        match self {
            EntityType::Room => "rooms",
            EntityType::Message => "message_text",
            EntityType::Contact => "contacts",
            EntityType::User => "users",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown entity type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "room" => Ok(EntityType::Room),
            "message" => Ok(EntityType::Message),
            "contact" => Ok(EntityType::Contact),
            "user" => Ok(EntityType::User),
            other => Err(UnknownEntityType(other.to_string())),
        }
    }
}

/// Kind of mutation applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Record was created.
    Create,
    /// Record was replaced by a newer version.
    Update,
    /// Record was deleted.
    Delete,
}

/// Typed pointer to one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Record category.
    pub entity_type: EntityType,
    /// Record identifier.
    pub id: EntityId,
}

impl EntityRef {
    /// Builds a reference from its parts.
    pub fn new(entity_type: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}
