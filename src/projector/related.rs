use crate::{
    document::{ContactSummary, RoomSummary, UserSummary},
    record::{ContactRecord, EntityRecord, RoomRecord, UserRecord},
};

/// Read access to the records a document embeds.
///
/// Implementations return live records only; a soft-deleted record is
/// reported as missing.
pub trait RelatedLookup: Send + Sync {
    fn room(&self, id: &str) -> Option<RoomRecord>;
    fn contact(&self, id: &str) -> Option<ContactRecord>;
    fn user(&self, id: &str) -> Option<UserRecord>;
}

/// Summaries of the related records resolved for one projection.
///
/// A `None` field means the related record is absent or deleted; the
/// projected document carries a null placeholder there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedEntitySnapshot {
    pub room: Option<RoomSummary>,
    pub contact: Option<ContactSummary>,
    pub user: Option<UserSummary>,
}

impl RelatedEntitySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolves every record `payload` embeds.
    pub fn resolve(payload: &EntityRecord, lookup: &dyn RelatedLookup) -> Self {
        match payload {
            EntityRecord::Message(m) => Self {
                room: lookup.room(&m.room_id).map(|room| room_summary(&room, lookup)),
                contact: m.contact_id.as_deref().and_then(|id| contact_summary(id, lookup)),
                user: m.user_id.as_deref().and_then(|id| user_summary(id, lookup)),
            },
            EntityRecord::Room(r) => Self {
                room: None,
                contact: r.contact_id.as_deref().and_then(|id| contact_summary(id, lookup)),
                user: r.user_id.as_deref().and_then(|id| user_summary(id, lookup)),
            },
            EntityRecord::Contact(_) | EntityRecord::User(_) => Self::empty(),
        }
    }
}

fn room_summary(room: &RoomRecord, lookup: &dyn RelatedLookup) -> RoomSummary {
    RoomSummary {
        id: room.id.clone(),
        contact: room
            .contact_id
            .as_deref()
            .and_then(|id| lookup.contact(id))
            .map(|c| c.name),
        is_active: room.is_active,
    }
}

fn contact_summary(id: &str, lookup: &dyn RelatedLookup) -> Option<ContactSummary> {
    lookup.contact(id).map(|c| ContactSummary { id: c.id, name: c.name })
}

fn user_summary(id: &str, lookup: &dyn RelatedLookup) -> Option<UserSummary> {
    lookup.user(id).map(|u| UserSummary {
        id: u.id.clone(),
        username: u.username().to_string(),
    })
}
