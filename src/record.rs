//! Canonical chat records held by the primary store.

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EntityRef, EntityType};

/// External person talking to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContactRecord {
    /// Stable contact id.
    pub id: EntityId,
    /// Identifier in the originating channel, if any.
    pub external_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Contact email.
    pub email: Option<String>,
    /// Free-form status text.
    pub status: String,
    /// Phone number.
    pub phone: String,
    /// Soft-delete flag.
    pub is_deleted: bool,
}

/// Agent account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserRecord {
    /// Stable user id.
    pub id: EntityId,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Login email, also used as the username.
    pub email: String,
    /// Preferred language tag.
    pub language: Option<String>,
    /// True when the account may log in.
    pub is_active: bool,
    /// Soft-delete flag.
    pub is_deleted: bool,
}

impl UserRecord {
    /// Name shown in search results.
    pub fn username(&self) -> &str {
        &self.email
    }

    /// First and last name joined, trimmed when either is blank.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Conversation between a contact and an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoomRecord {
    /// Stable room id.
    pub id: EntityId,
    /// Assigned agent.
    pub user_id: Option<EntityId>,
    /// Contact in the room.
    pub contact_id: Option<EntityId>,
    /// Queue that routed the room.
    pub queue_id: Option<EntityId>,
    /// Channel URN of the contact.
    pub urn: String,
    /// True while the room is open.
    pub is_active: bool,
    /// True while the contact waits for an answer.
    pub is_waiting: bool,
    /// Who closed the room.
    pub ended_by: Option<String>,
    /// Soft-delete flag.
    pub is_deleted: bool,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageRecord {
    /// Stable message id.
    pub id: EntityId,
    /// Owning room. Mandatory.
    pub room_id: EntityId,
    /// Sending agent, if sent by an agent.
    pub user_id: Option<EntityId>,
    /// Sending contact, if sent by a contact.
    pub contact_id: Option<EntityId>,
    /// Message body.
    pub text: Option<String>,
    /// Read receipt.
    pub seen: bool,
    /// Soft-delete flag.
    pub is_deleted: bool,
}

/// Any canonical record, tagged by entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRecord {
    /// Room payload.
    Room(RoomRecord),
    /// Message payload.
    Message(MessageRecord),
    /// Contact payload.
    Contact(ContactRecord),
    /// User payload.
    User(UserRecord),
}

impl EntityRecord {
    /// Entity type of the wrapped record.
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityRecord::Room(_) => EntityType::Room,
            EntityRecord::Message(_) => EntityType::Message,
            EntityRecord::Contact(_) => EntityType::Contact,
            EntityRecord::User(_) => EntityType::User,
        }
    }

    /// Identifier of the wrapped record.
    pub fn id(&self) -> &str {
        match self {
            EntityRecord::Room(r) => &r.id,
            EntityRecord::Message(r) => &r.id,
            EntityRecord::Contact(r) => &r.id,
            EntityRecord::User(r) => &r.id,
        }
    }

    /// Typed pointer to the wrapped record.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type(), self.id())
    }

    /// Soft-delete flag of the wrapped record.
    pub fn is_deleted(&self) -> bool {
        match self {
            EntityRecord::Room(r) => r.is_deleted,
            EntityRecord::Message(r) => r.is_deleted,
            EntityRecord::Contact(r) => r.is_deleted,
            EntityRecord::User(r) => r.is_deleted,
        }
    }

    /// Sets the soft-delete flag. Identifying fields are left untouched.
    pub fn set_deleted(&mut self, deleted: bool) {
        match self {
            EntityRecord::Room(r) => r.is_deleted = deleted,
            EntityRecord::Message(r) => r.is_deleted = deleted,
            EntityRecord::Contact(r) => r.is_deleted = deleted,
            EntityRecord::User(r) => r.is_deleted = deleted,
        }
    }

    /// Records this one points at, mandatory references first.
    pub fn references(&self) -> Vec<EntityRef> {
        let mut out = Vec::new();
        match self {
            EntityRecord::Room(r) => {
                if let Some(id) = &r.contact_id {
                    out.push(EntityRef::new(EntityType::Contact, id.clone()));
                }
                if let Some(id) = &r.user_id {
                    out.push(EntityRef::new(EntityType::User, id.clone()));
                }
            }
            EntityRecord::Message(r) => {
                out.push(EntityRef::new(EntityType::Room, r.room_id.clone()));
                if let Some(id) = &r.contact_id {
                    out.push(EntityRef::new(EntityType::Contact, id.clone()));
                }
                if let Some(id) = &r.user_id {
                    out.push(EntityRef::new(EntityType::User, id.clone()));
                }
            }
            EntityRecord::Contact(_) | EntityRecord::User(_) => {}
        }
        out
    }
}
