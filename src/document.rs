//! Denormalized search documents.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EntityType};

/// Address of a document in the search index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    /// Index (entity type) holding the document.
    pub index: EntityType,
    /// Document id, equal to the source entity id.
    pub id: EntityId,
}

impl DocKey {
    /// Builds a key from its parts.
    pub fn new(index: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            index,
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index.index_name(), self.id)
    }
}

/// Room fields embedded in other documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    /// Room id.
    pub id: EntityId,
    /// Name of the room's contact, when resolvable.
    pub contact: Option<String>,
    /// True while the room is open.
    pub is_active: bool,
}

/// Contact fields embedded in other documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSummary {
    /// Contact id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
}

/// User fields embedded in other documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// User id.
    pub id: EntityId,
    /// Login name.
    pub username: String,
}

/// Indexed form of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDocument {
    /// Owning room, `None` when it could not be resolved.
    pub room: Option<RoomSummary>,
    /// Sending agent.
    pub user: Option<UserSummary>,
    /// Sending contact.
    pub contact: Option<ContactSummary>,
    /// Message body.
    pub text: Option<String>,
    /// Read receipt.
    pub seen: bool,
}

/// Indexed form of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDocument {
    /// Contact in the room.
    pub contact: Option<ContactSummary>,
    /// Assigned agent.
    pub user: Option<UserSummary>,
    /// Channel URN.
    pub urn: String,
    /// True while the room is open.
    pub is_active: bool,
    /// True while the contact waits for an answer.
    pub is_waiting: bool,
    /// Who closed the room.
    pub ended_by: Option<String>,
}

/// Indexed form of a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDocument {
    /// Display name.
    pub name: String,
    /// Contact email.
    pub email: Option<String>,
    /// Phone number.
    pub phone: String,
    /// Status text.
    pub status: String,
    /// Identifier in the originating channel.
    pub external_id: Option<String>,
}

/// Indexed form of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDocument {
    /// Login name.
    pub username: String,
    /// First and last name.
    pub full_name: String,
    /// Preferred language tag.
    pub language: Option<String>,
    /// True when the account may log in.
    pub is_active: bool,
}

/// Document body, one variant per entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentBody {
    /// Message body.
    Message(MessageDocument),
    /// Room body.
    Room(RoomDocument),
    /// Contact body.
    Contact(ContactDocument),
    /// User body.
    User(UserDocument),
}

/// Whole document as written to the index. Always rebuilt, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    /// Index address.
    pub key: DocKey,
    /// Denormalized fields.
    pub body: DocumentBody,
}

impl SearchDocument {
    /// Document id.
    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Canonical JSON encoding. Equal documents encode to equal bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
