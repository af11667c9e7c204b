use std::sync::Arc;

use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, SyncConfig},
    event::MutationEvent,
    feed::{ChangeFeedReader, FeedSource},
    index::{
        writer::{spawn_index_writer, IndexWriterHandle},
        DocOutcome, IndexError, IndexOp, SearchIndex,
    },
    persist::{CheckpointStore, PersistError},
    projector::{related::RelatedEntitySnapshot, related::RelatedLookup, Projector},
    tracker::{CheckpointError, ConsistencyTracker},
    types::{EntityId, EntityType, Offset, Operation},
};

use super::{
    backoff::Backoff,
    events::{PipelineEvent, Stage},
};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("{entity_type} worker panicked: {message}")]
    WorkerPanicked {
        entity_type: EntityType,
        message: String,
    },
    #[error("runtime channel closed")]
    ChannelClosed,
}

/// Everything a pipeline talks to.
pub struct PipelineDeps {
    pub feed: Arc<dyn FeedSource>,
    pub related: Arc<dyn RelatedLookup>,
    pub index: Box<dyn SearchIndex>,
    pub checkpoints: Box<dyn CheckpointStore>,
}

impl PipelineDeps {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        related: Arc<dyn RelatedLookup>,
        index: Box<dyn SearchIndex>,
        checkpoints: Box<dyn CheckpointStore>,
    ) -> Self {
        Self {
            feed,
            related,
            index,
            checkpoints,
        }
    }

    /// Uses the checkpoint store named by `config`.
    pub fn with_configured_checkpoints(
        config: &SyncConfig,
        feed: Arc<dyn FeedSource>,
        related: Arc<dyn RelatedLookup>,
        index: Box<dyn SearchIndex>,
    ) -> Result<Self, RuntimeError> {
        let checkpoints = config.open_checkpoint_store()?;
        Ok(Self::new(feed, related, index, checkpoints))
    }
}

pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<PipelineEvent>,
    tracker: Arc<ConsistencyTracker>,
    writer: IndexWriterHandle,
    workers: Vec<(EntityType, JoinHandle<Result<Offset, RuntimeError>>)>,
}

/// Starts one worker per configured entity type, each resuming from its
/// durable checkpoint.
pub async fn spawn_pipeline(config: SyncConfig, deps: PipelineDeps) -> Result<PipelineHandle, RuntimeError> {
    config.validate()?;

    let tracker = Arc::new(ConsistencyTracker::new(deps.checkpoints));
    for entity_type in &config.entity_types {
        let offset = tracker.load(*entity_type).await?;
        info!(entity_type = %entity_type, offset, "resuming from checkpoint");
    }

    let (shutdown_tx, _) = watch::channel(false);
    let (events_tx, _) = broadcast::channel::<PipelineEvent>(1024);
    let writer = spawn_index_writer(deps.index, config.writer_config());

    let mut workers = Vec::with_capacity(config.entity_types.len());
    for entity_type in config.entity_types.iter().copied() {
        let worker = Worker {
            entity_type,
            reader: ChangeFeedReader::new(Arc::clone(&deps.feed), entity_type, config.reader_options()),
            related: Arc::clone(&deps.related),
            projector: Projector::new(),
            writer: writer.clone(),
            tracker: Arc::clone(&tracker),
            events_tx: events_tx.clone(),
            backoff: config.backoff(),
            batch_max_size: config.batch_max_size,
        };
        let shutdown_rx = shutdown_tx.subscribe();
        workers.push((entity_type, tokio::spawn(worker.run(shutdown_rx))));
    }

    Ok(PipelineHandle {
        shutdown_tx,
        events_tx,
        tracker,
        writer,
        workers,
    })
}

impl PipelineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events_tx.subscribe()
    }

    /// Durable checkpoint of `entity_type`.
    pub fn checkpoint(&self, entity_type: EntityType) -> Offset {
        self.tracker.checkpoint(entity_type)
    }

    /// Waits for every worker to drain a closed feed, then stops the index
    /// writer.
    pub async fn join(self) -> Result<(), RuntimeError> {
        let Self {
            shutdown_tx,
            writer,
            workers,
            ..
        } = self;

        let mut first_err = None;
        for (entity_type, worker) in workers {
            let result = match worker.await {
                Ok(result) => result.map(|_| ()),
                Err(e) => Err(RuntimeError::WorkerPanicked {
                    entity_type,
                    message: e.to_string(),
                }),
            };
            if let Err(err) = result {
                warn!(entity_type = %entity_type, error = %err, "worker failed");
                first_err.get_or_insert(err);
            }
        }

        if let Err(err) = writer.shutdown().await {
            debug!(error = %err, "index writer already stopped");
        }
        drop(shutdown_tx);

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops pulling new events, lets in-flight batches finish and persist
    /// their checkpoints, then stops the writer.
    pub async fn shutdown(self) -> Result<(), RuntimeError> {
        info!("pipeline shutdown requested");
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }
}

struct Worker {
    entity_type: EntityType,
    reader: ChangeFeedReader,
    related: Arc<dyn RelatedLookup>,
    projector: Projector,
    writer: IndexWriterHandle,
    tracker: Arc<ConsistencyTracker>,
    events_tx: broadcast::Sender<PipelineEvent>,
    backoff: Backoff,
    batch_max_size: usize,
}

struct Projected {
    ops: Vec<IndexOp>,
    sources: Vec<(Offset, EntityId)>,
    rejected: usize,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<Offset, RuntimeError> {
        let et = self.entity_type;
        self.reader.resume_from(self.tracker.checkpoint(et));
        info!(entity_type = %et, offset = self.reader.position(), "worker started");

        while let Some(first) = self.read_with_retry(&mut shutdown).await {
            let batch = self.coalesce(first);
            let last_offset = batch.last().map(|e| e.offset).unwrap_or_default();

            let projected = self.project(&batch);
            let Projected {
                ops,
                sources,
                mut rejected,
            } = projected;

            let mut applied = 0;
            if !ops.is_empty() {
                let Some(outcomes) = self.apply_with_retry(ops, &mut shutdown).await? else {
                    break;
                };
                for (outcome, (offset, entity_id)) in outcomes.into_iter().zip(sources) {
                    match outcome {
                        DocOutcome::Applied => applied += 1,
                        DocOutcome::Rejected { reason } => {
                            rejected += 1;
                            self.report_rejection(offset, entity_id, reason);
                        }
                    }
                }
            }

            debug!(entity_type = %et, offset = last_offset, applied, rejected, "batch applied");
            let _ = self.events_tx.send(PipelineEvent::Applied {
                entity_type: et,
                offset: last_offset,
                applied,
                rejected,
            });

            if !self.advance_with_retry(last_offset, &mut shutdown).await? {
                break;
            }
        }

        let checkpoint = self.tracker.checkpoint(et);
        info!(entity_type = %et, checkpoint, "worker stopped");
        let _ = self.events_tx.send(PipelineEvent::WorkerStopped {
            entity_type: et,
            checkpoint,
        });
        Ok(checkpoint)
    }

    /// Next event, or `None` on shutdown or once a closed feed is drained.
    async fn read_with_retry(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<MutationEvent> {
        let mut attempt = 0u32;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return None,
                next = self.reader.next() => next,
            };

            match next {
                Ok(Some(event)) => {
                    self.tracker.observe(self.entity_type, event.offset);
                    return Some(event);
                }
                Ok(None) => return None,
                Err(err) => {
                    warn!(entity_type = %self.entity_type, attempt, error = %err, "feed read failed");
                    if !self.sleep_before_retry(Stage::Feed, attempt, shutdown).await {
                        return None;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn coalesce(&mut self, first: MutationEvent) -> Vec<MutationEvent> {
        let mut batch = vec![first];
        while batch.len() < self.batch_max_size {
            let Some(event) = self.reader.try_next_buffered() else {
                break;
            };
            self.tracker.observe(self.entity_type, event.offset);
            batch.push(event);
        }
        batch
    }

    fn project(&self, batch: &[MutationEvent]) -> Projected {
        let mut out = Projected {
            ops: Vec::with_capacity(batch.len()),
            sources: Vec::with_capacity(batch.len()),
            rejected: 0,
        };

        for event in batch {
            let related = match (&event.op, &event.payload) {
                (Operation::Create | Operation::Update, Some(payload)) => {
                    RelatedEntitySnapshot::resolve(payload, self.related.as_ref())
                }
                _ => RelatedEntitySnapshot::empty(),
            };

            match self.projector.project(event, &related) {
                Ok(projection) => {
                    out.ops.push(IndexOp::from(projection));
                    out.sources.push((event.offset, event.entity_id.clone()));
                }
                Err(err) => {
                    out.rejected += 1;
                    self.report_rejection(event.offset, event.entity_id.clone(), err.to_string());
                }
            }
        }
        out
    }

    /// `Ok(None)` when shutdown interrupted a retry wait.
    async fn apply_with_retry(
        &self,
        ops: Vec<IndexOp>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Vec<DocOutcome>>, RuntimeError> {
        let mut attempt = 0u32;
        loop {
            match self.writer.apply_batch(ops.clone()).await {
                Ok(outcomes) => return Ok(Some(outcomes)),
                Err(IndexError::ChannelClosed) => return Err(RuntimeError::ChannelClosed),
                Err(err) if err.is_transient() => {
                    warn!(entity_type = %self.entity_type, attempt, error = %err, "index write failed");
                    if !self.sleep_before_retry(Stage::Index, attempt, shutdown).await {
                        return Ok(None);
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => {
                    let reason = err.to_string();
                    return Ok(Some(
                        ops.iter()
                            .map(|_| DocOutcome::Rejected { reason: reason.clone() })
                            .collect(),
                    ));
                }
            }
        }
    }

    /// `Ok(false)` when shutdown interrupted a retry wait.
    async fn advance_with_retry(
        &self,
        offset: Offset,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, RuntimeError> {
        let et = self.entity_type;
        let before = self.tracker.checkpoint(et);
        let mut attempt = 0u32;
        loop {
            match self.tracker.advance(et, offset).await {
                Ok(checkpoint) => {
                    if checkpoint > before {
                        let _ = self.events_tx.send(PipelineEvent::CheckpointAdvanced {
                            entity_type: et,
                            offset: checkpoint,
                        });
                    }
                    return Ok(true);
                }
                Err(err @ CheckpointError::AheadOfFeed { .. }) => return Err(err.into()),
                Err(err) => {
                    warn!(entity_type = %et, offset, attempt, error = %err, "checkpoint persist failed");
                    if !self.sleep_before_retry(Stage::Checkpoint, attempt, shutdown).await {
                        return Ok(false);
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Returns false if shutdown was requested during the wait.
    async fn sleep_before_retry(&self, stage: Stage, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.backoff.delay_for_attempt(attempt);
        let _ = self.events_tx.send(PipelineEvent::Retrying {
            entity_type: self.entity_type,
            stage,
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn report_rejection(&self, offset: Offset, entity_id: EntityId, reason: String) {
        warn!(entity_type = %self.entity_type, offset, entity_id = %entity_id, reason = %reason, "event rejected");
        let _ = self.events_tx.send(PipelineEvent::Rejected {
            entity_type: self.entity_type,
            offset,
            entity_id,
            reason,
        });
    }
}

/// Resolves once shutdown is requested or the handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
