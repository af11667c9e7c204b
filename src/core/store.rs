use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    event::MutationEvent,
    projector::related::RelatedLookup,
    record::{ContactRecord, EntityRecord, MessageRecord, RoomRecord, UserRecord},
    types::{EntityId, EntityRef, EntityType, Offset, Operation},
};

use super::indices::{link, unlink, VecIndex};

/// Record store shared between writers and the pipeline's related lookups.
pub type SharedStore = Arc<RwLock<RecordStore>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    Missing(EntityRef),
    #[error("record {0} is already deleted")]
    AlreadyDeleted(EntityRef),
    #[error("{referrer} references {target}, which is missing or deleted")]
    DanglingReference { referrer: EntityRef, target: EntityRef },
    #[error("record id must not be empty")]
    EmptyId,
}

/// Serializable copy of a [`RecordStore`]. Pending events are not included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Last offset assigned per entity type.
    pub heads: Vec<(EntityType, Offset)>,
    /// Every record, soft-deleted ones included, ordered by key.
    pub records: Vec<EntityRecord>,
}

impl StoreSnapshot {
    /// Offset of the last `entity_type` event reflected in the snapshot.
    pub fn head(&self, entity_type: EntityType) -> Offset {
        self.heads
            .iter()
            .find(|(et, _)| *et == entity_type)
            .map(|(_, offset)| *offset)
            .unwrap_or(0)
    }
}

/// Primary store of chat records.
///
/// Every mutation is assigned the next offset of its entity type's stream and
/// queued as a [`MutationEvent`] until [`RecordStore::drain_pending_events`].
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<EntityRef, EntityRecord>,
    referrers: VecIndex<EntityRef>,
    next_offset: HashMap<EntityType, Offset>,
    pending: Vec<MutationEvent>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut store = Self::new();
        for (entity_type, offset) in snapshot.heads {
            store.continue_from(entity_type, offset);
        }
        for record in snapshot.records {
            let key = record.entity_ref();
            if !record.is_deleted() {
                for target in record.references() {
                    link(&mut store.referrers, target, key.clone());
                }
            }
            store.records.insert(key, record);
        }
        store
    }

    pub fn export_snapshot(&self) -> StoreSnapshot {
        let heads: Vec<(EntityType, Offset)> = EntityType::ALL
            .into_iter()
            .map(|et| (et, self.latest_offset(et)))
            .filter(|(_, offset)| *offset > 0)
            .collect();

        let mut keys: Vec<&EntityRef> = self.records.keys().collect();
        keys.sort();
        let records = keys
            .into_iter()
            .filter_map(|key| self.records.get(key).cloned())
            .collect();

        StoreSnapshot { heads, records }
    }

    /// Makes the next offset assigned for `entity_type` at least `offset + 1`.
    pub fn continue_from(&mut self, entity_type: EntityType, offset: Offset) {
        let next = self.next_offset.entry(entity_type).or_insert(1);
        *next = (*next).max(offset.saturating_add(1));
    }

    pub fn latest_offset(&self, entity_type: EntityType) -> Offset {
        self.next_offset
            .get(&entity_type)
            .copied()
            .unwrap_or(1)
            .saturating_sub(1)
    }

    /// Creates or replaces a record.
    ///
    /// Every reference must be live, unless the current version of the record
    /// already holds it. Emits `create` when the record is absent or
    /// soft-deleted and `update` otherwise. Records embedding this one get an `update` event carrying
    /// their current snapshot.
    pub fn upsert(&mut self, record: EntityRecord) -> Result<MutationEvent, StoreError> {
        let key = record.entity_ref();
        if key.id.is_empty() {
            return Err(StoreError::EmptyId);
        }

        let mut record = record;
        record.set_deleted(false);

        let old_refs = self
            .live(&key)
            .map(EntityRecord::references);
        let existed = old_refs.is_some();

        // A live record may keep pointing at a target deleted after it was
        // written; the document renders that target as a null placeholder.
        for target in record.references() {
            let kept = old_refs.as_ref().is_some_and(|refs| refs.contains(&target));
            if !kept && !self.is_live(&target) {
                return Err(StoreError::DanglingReference { referrer: key, target });
            }
        }

        for target in old_refs.unwrap_or_default() {
            unlink(&mut self.referrers, &target, &key);
        }
        for target in record.references() {
            link(&mut self.referrers, target, key.clone());
        }
        self.records.insert(key.clone(), record.clone());

        let offset = self.take_next_offset(key.entity_type);
        let event = if existed {
            MutationEvent::update(offset, now_ms(), record)
        } else {
            MutationEvent::create(offset, now_ms(), record)
        };
        self.pending.push(event.clone());
        self.touch_dependents(&key);
        Ok(event)
    }

    /// Soft-deletes a record.
    ///
    /// Deleting a room deletes its messages. Deleting a contact or user
    /// re-emits the records that embed it.
    pub fn delete(&mut self, entity_type: EntityType, id: &str) -> Result<MutationEvent, StoreError> {
        let key = EntityRef::new(entity_type, id);
        let record = self
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::Missing(key.clone()))?;
        if record.is_deleted() {
            return Err(StoreError::AlreadyDeleted(key));
        }
        record.set_deleted(true);
        let refs = record.references();
        for target in refs {
            unlink(&mut self.referrers, &target, &key);
        }

        let offset = self.take_next_offset(entity_type);
        let event = MutationEvent::delete(offset, now_ms(), key.clone());
        self.pending.push(event.clone());

        match entity_type {
            EntityType::Room => {
                let messages: Vec<EntityId> = self
                    .referrers
                    .get(&key)
                    .into_iter()
                    .flatten()
                    .filter(|r| r.entity_type == EntityType::Message)
                    .map(|r| r.id.clone())
                    .collect();
                for message_id in messages {
                    self.delete(EntityType::Message, &message_id)?;
                }
                self.referrers.remove(&key);
            }
            EntityType::Contact | EntityType::User => self.touch_dependents(&key),
            EntityType::Message => {}
        }

        Ok(event)
    }

    /// Applies an event read back from a journal without emitting anything.
    pub fn apply_replayed_event(&mut self, event: &MutationEvent) -> Result<(), StoreError> {
        let key = event.entity_ref();
        match (&event.op, &event.payload) {
            (Operation::Create | Operation::Update, Some(record)) => {
                if let Some(old) = self.live(&key).map(EntityRecord::references) {
                    for target in old {
                        unlink(&mut self.referrers, &target, &key);
                    }
                }
                for target in record.references() {
                    link(&mut self.referrers, target, key.clone());
                }
                self.records.insert(key, record.clone());
            }
            (Operation::Create | Operation::Update, None) => return Err(StoreError::Missing(key)),
            (Operation::Delete, _) => {
                let record = self
                    .records
                    .get_mut(&key)
                    .ok_or_else(|| StoreError::Missing(key.clone()))?;
                record.set_deleted(true);
                let refs = record.references();
                for target in refs {
                    unlink(&mut self.referrers, &target, &key);
                }
            }
        }
        self.continue_from(event.entity_type, event.offset);
        Ok(())
    }

    pub fn get(&self, key: &EntityRef) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    /// Returns the record only when it is not soft-deleted.
    pub fn live(&self, key: &EntityRef) -> Option<&EntityRecord> {
        self.records.get(key).filter(|r| !r.is_deleted())
    }

    pub fn is_live(&self, key: &EntityRef) -> bool {
        self.live(key).is_some()
    }

    /// Sorted ids of live records of one type.
    pub fn live_ids(&self, entity_type: EntityType) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .records
            .iter()
            .filter(|(k, r)| k.entity_type == entity_type && !r.is_deleted())
            .map(|(k, _)| k.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn room(&self, id: &str) -> Option<&RoomRecord> {
        match self.live(&EntityRef::new(EntityType::Room, id)) {
            Some(EntityRecord::Room(r)) => Some(r),
            _ => None,
        }
    }

    pub fn message(&self, id: &str) -> Option<&MessageRecord> {
        match self.live(&EntityRef::new(EntityType::Message, id)) {
            Some(EntityRecord::Message(r)) => Some(r),
            _ => None,
        }
    }

    pub fn contact(&self, id: &str) -> Option<&ContactRecord> {
        match self.live(&EntityRef::new(EntityType::Contact, id)) {
            Some(EntityRecord::Contact(r)) => Some(r),
            _ => None,
        }
    }

    pub fn user(&self, id: &str) -> Option<&UserRecord> {
        match self.live(&EntityRef::new(EntityType::User, id)) {
            Some(EntityRecord::User(r)) => Some(r),
            _ => None,
        }
    }

    pub fn drain_pending_events(&mut self) -> Vec<MutationEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Emits an `update` for every live record whose document embeds `origin`,
    /// following references transitively (contact -> room -> message).
    fn touch_dependents(&mut self, origin: &EntityRef) {
        let mut seen: HashSet<EntityRef> = HashSet::new();
        let mut queue: VecDeque<EntityRef> = VecDeque::new();
        let mut touched: Vec<EntityRef> = Vec::new();
        queue.push_back(origin.clone());

        while let Some(target) = queue.pop_front() {
            let Some(deps) = self.referrers.get(&target) else {
                continue;
            };
            for dep in deps {
                if seen.insert(dep.clone()) {
                    touched.push(dep.clone());
                    queue.push_back(dep.clone());
                }
            }
        }

        for dep in touched {
            let Some(record) = self.live(&dep).cloned() else {
                continue;
            };
            let offset = self.take_next_offset(dep.entity_type);
            self.pending.push(MutationEvent::update(offset, now_ms(), record));
        }
    }

    fn take_next_offset(&mut self, entity_type: EntityType) -> Offset {
        let next = self.next_offset.entry(entity_type).or_insert(1);
        let offset = *next;
        *next += 1;
        offset
    }
}

impl RelatedLookup for RecordStore {
    fn room(&self, id: &str) -> Option<RoomRecord> {
        RecordStore::room(self, id).cloned()
    }

    fn contact(&self, id: &str) -> Option<ContactRecord> {
        RecordStore::contact(self, id).cloned()
    }

    fn user(&self, id: &str) -> Option<UserRecord> {
        RecordStore::user(self, id).cloned()
    }
}

impl RelatedLookup for RwLock<RecordStore> {
    fn room(&self, id: &str) -> Option<RoomRecord> {
        RelatedLookup::room(&*self.read(), id)
    }

    fn contact(&self, id: &str) -> Option<ContactRecord> {
        RelatedLookup::contact(&*self.read(), id)
    }

    fn user(&self, id: &str) -> Option<UserRecord> {
        RelatedLookup::user(&*self.read(), id)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
