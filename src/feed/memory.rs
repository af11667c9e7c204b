use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::{
    event::MutationEvent,
    types::{EntityType, Offset},
};

use super::{FeedError, FeedResult, FeedSource};

/// In-process change feed keeping every published event.
///
/// Readers are woken on publish and on close.
pub struct MemoryFeed {
    streams: RwLock<HashMap<EntityType, Vec<MutationEvent>>>,
    closed: AtomicBool,
    wake: watch::Sender<u64>,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            streams: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            wake,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Appends events. The whole batch is refused if any offset is not
    /// strictly after the latest one of its stream.
    pub fn publish(&self, events: impl IntoIterator<Item = MutationEvent>) -> FeedResult<usize> {
        let events: Vec<MutationEvent> = events.into_iter().collect();
        let mut streams = self.streams.write();

        let mut latest: HashMap<EntityType, Offset> = HashMap::new();
        for event in &events {
            let last = *latest.entry(event.entity_type).or_insert_with(|| {
                streams
                    .get(&event.entity_type)
                    .and_then(|s| s.last())
                    .map(|e| e.offset)
                    .unwrap_or(0)
            });
            if event.offset <= last {
                return Err(FeedError::OutOfOrder {
                    entity_type: event.entity_type,
                    offset: event.offset,
                    latest: last,
                });
            }
            latest.insert(event.entity_type, event.offset);
        }

        let count = events.len();
        for event in events {
            streams.entry(event.entity_type).or_default().push(event);
        }
        drop(streams);

        if count > 0 {
            self.wake.send_modify(|v| *v = v.wrapping_add(1));
        }
        Ok(count)
    }

    /// Marks the feed finished; readers return end-of-stream once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn latest_offset(&self, entity_type: EntityType) -> Offset {
        self.streams
            .read()
            .get(&entity_type)
            .and_then(|s| s.last())
            .map(|e| e.offset)
            .unwrap_or(0)
    }

    pub fn len(&self, entity_type: EntityType) -> usize {
        self.streams.read().get(&entity_type).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().values().all(Vec::is_empty)
    }
}

impl FeedSource for MemoryFeed {
    fn fetch_after(&self, entity_type: EntityType, after: Offset, limit: usize) -> FeedResult<Vec<MutationEvent>> {
        let streams = self.streams.read();
        let Some(stream) = streams.get(&entity_type) else {
            return Ok(Vec::new());
        };
        let start = stream.partition_point(|e| e.offset <= after);
        Ok(stream[start..].iter().take(limit).cloned().collect())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.wake.subscribe())
    }
}
