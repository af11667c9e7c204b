//! One mapping function per entity type, from record plus related summaries
//! to document body.

use crate::{
    document::{ContactDocument, MessageDocument, RoomDocument, UserDocument},
    record::{ContactRecord, MessageRecord, RoomRecord, UserRecord},
};

use super::related::RelatedEntitySnapshot;

pub fn message_document(message: &MessageRecord, related: &RelatedEntitySnapshot) -> MessageDocument {
    MessageDocument {
        room: related.room.clone(),
        user: related.user.clone(),
        contact: related.contact.clone(),
        text: message.text.clone(),
        seen: message.seen,
    }
}

pub fn room_document(room: &RoomRecord, related: &RelatedEntitySnapshot) -> RoomDocument {
    RoomDocument {
        contact: related.contact.clone(),
        user: related.user.clone(),
        urn: room.urn.clone(),
        is_active: room.is_active,
        is_waiting: room.is_waiting,
        ended_by: room.ended_by.clone(),
    }
}

pub fn contact_document(contact: &ContactRecord) -> ContactDocument {
    ContactDocument {
        name: contact.name.clone(),
        email: contact.email.clone(),
        phone: contact.phone.clone(),
        status: contact.status.clone(),
        external_id: contact.external_id.clone(),
    }
}

pub fn user_document(user: &UserRecord) -> UserDocument {
    UserDocument {
        username: user.username().to_string(),
        full_name: user.full_name(),
        language: user.language.clone(),
        is_active: user.is_active,
    }
}
