//! Ordered, resumable change feed reading.

/// In-process change feed.
pub mod memory;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    event::MutationEvent,
    persist::PersistError,
    types::{EntityType, Offset},
};

/// Change feed failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Upstream unreachable. Transient: retry with backoff.
    #[error("change feed unavailable: {0}")]
    Unavailable(String),
    /// A publisher tried to append an offset that is not strictly increasing.
    #[error("{entity_type} offset {offset} is not after {latest}")]
    OutOfOrder {
        /// Stream being appended to.
        entity_type: EntityType,
        /// Rejected offset.
        offset: Offset,
        /// Latest offset already in the stream.
        latest: Offset,
    },
}

impl From<PersistError> for FeedError {
    fn from(value: PersistError) -> Self {
        Self::Unavailable(value.to_string())
    }
}

/// Result alias for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// Upstream transport of mutation events.
///
/// Only ordering per entity type and an offset cursor are required; how
/// events travel is up to the implementation.
pub trait FeedSource: Send + Sync + 'static {
    /// Returns up to `limit` events of `entity_type` with offset `> after`,
    /// in offset order.
    fn fetch_after(&self, entity_type: EntityType, after: Offset, limit: usize) -> FeedResult<Vec<MutationEvent>>;

    /// True once no further events will ever be published.
    fn is_closed(&self) -> bool {
        false
    }

    /// Channel bumped whenever new events may be available. Sources without
    /// one are polled.
    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Tuning for [`ChangeFeedReader`].
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Maximum events fetched per round trip.
    pub fetch_limit: usize,
    /// Wait between polls when the source has no wake-up channel, and the
    /// upper bound on a wait when it does.
    pub poll_interval: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            fetch_limit: 256,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Lazy, ordered reader over one entity type's stream.
pub struct ChangeFeedReader {
    source: Arc<dyn FeedSource>,
    entity_type: EntityType,
    position: Offset,
    fetched: Offset,
    buffer: VecDeque<MutationEvent>,
    wake: Option<watch::Receiver<u64>>,
    options: ReaderOptions,
}

impl ChangeFeedReader {
    /// Creates a reader positioned at the start of the stream.
    pub fn new(source: Arc<dyn FeedSource>, entity_type: EntityType, options: ReaderOptions) -> Self {
        let wake = source.subscribe();
        Self {
            source,
            entity_type,
            position: 0,
            fetched: 0,
            buffer: VecDeque::new(),
            wake,
            options,
        }
    }

    /// Stream this reader follows.
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Offset of the last event handed out, or the resume point.
    pub fn position(&self) -> Offset {
        self.position
    }

    /// Re-positions the reader; events with offset `<= offset` are skipped.
    pub fn resume_from(&mut self, offset: Offset) {
        self.position = offset;
        self.fetched = offset;
        self.buffer.clear();
    }

    /// Next event, waiting cooperatively while the stream is idle.
    ///
    /// Returns `Ok(None)` once the source is closed and drained.
    pub async fn next(&mut self) -> FeedResult<Option<MutationEvent>> {
        loop {
            if let Some(event) = self.pop_buffered() {
                return Ok(Some(event));
            }

            if let Some(wake) = self.wake.as_mut() {
                let _ = wake.borrow_and_update();
            }
            // Sampled before fetching so events published right before
            // close are still drained.
            let closed = self.source.is_closed();

            self.fill().await?;
            if !self.buffer.is_empty() {
                continue;
            }
            if closed {
                return Ok(None);
            }
            self.wait().await;
        }
    }

    /// Next already-fetched event, without touching the source.
    pub fn try_next_buffered(&mut self) -> Option<MutationEvent> {
        self.pop_buffered()
    }

    fn pop_buffered(&mut self) -> Option<MutationEvent> {
        let event = self.buffer.pop_front()?;
        self.position = event.offset;
        Some(event)
    }

    async fn fill(&mut self) -> FeedResult<()> {
        let source = Arc::clone(&self.source);
        let entity_type = self.entity_type;
        let after = self.fetched;
        let limit = self.options.fetch_limit.max(1);

        let events = tokio::task::spawn_blocking(move || source.fetch_after(entity_type, after, limit))
            .await
            .map_err(|e| FeedError::Unavailable(format!("join error: {e}")))??;

        for event in events {
            if event.entity_type != self.entity_type {
                warn!(
                    entity_type = %self.entity_type,
                    got = %event.entity_type,
                    offset = event.offset,
                    "skipping event from another stream"
                );
                continue;
            }
            if event.offset <= self.fetched {
                debug!(entity_type = %self.entity_type, offset = event.offset, "skipping already-read event");
                continue;
            }
            self.fetched = event.offset;
            self.buffer.push_back(event);
        }
        Ok(())
    }

    async fn wait(&mut self) {
        let poll = self.options.poll_interval;
        let Some(wake) = self.wake.as_mut() else {
            tokio::time::sleep(poll).await;
            return;
        };

        let sender_gone = tokio::select! {
            changed = wake.changed() => changed.is_err(),
            _ = tokio::time::sleep(poll) => false,
        };
        if sender_gone {
            self.wake = None;
        }
    }
}
