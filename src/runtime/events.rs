//! Runtime event stream payloads.

use crate::types::{EntityId, EntityType, Offset};

/// Pipeline stage a retry happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading the change feed.
    Feed,
    /// Writing to the search index.
    Index,
    /// Persisting the checkpoint.
    Checkpoint,
}

/// Events emitted by the per-entity-type workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A batch went through the index.
    Applied {
        /// Stream of the batch.
        entity_type: EntityType,
        /// Last offset in the batch.
        offset: Offset,
        /// Documents written.
        applied: usize,
        /// Events skipped as permanently rejected.
        rejected: usize,
    },
    /// One event was skipped permanently.
    Rejected {
        /// Stream of the event.
        entity_type: EntityType,
        /// Offset of the event.
        offset: Offset,
        /// Entity the event was about.
        entity_id: EntityId,
        /// Why it was skipped.
        reason: String,
    },
    /// The durable checkpoint moved.
    CheckpointAdvanced {
        /// Stream of the checkpoint.
        entity_type: EntityType,
        /// New checkpoint.
        offset: Offset,
    },
    /// A transient failure is being retried.
    Retrying {
        /// Stream of the worker.
        entity_type: EntityType,
        /// Failing stage.
        stage: Stage,
        /// 0-based retry number.
        attempt: u32,
        /// Delay before the retry.
        delay_ms: u64,
    },
    /// A worker exited.
    WorkerStopped {
        /// Stream of the worker.
        entity_type: EntityType,
        /// Checkpoint at exit.
        checkpoint: Offset,
    },
}
