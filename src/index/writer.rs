use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use super::{Ack, DocOutcome, IndexError, IndexOp, SearchIndex};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Upper bound on documents per bulk request.
    pub batch_max_size: usize,
    /// Longest a request waits for others to share its bulk.
    pub batch_max_wait: Duration,
    /// Capacity of the request queue.
    pub queue_bound: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_max_size: 64,
            batch_max_wait: Duration::from_millis(50),
            queue_bound: 64,
        }
    }
}

/// Cloneable handle to the writer task.
///
/// Every `apply*` call resolves only after all of its own documents went
/// through a bulk request, even when they were batched with other callers.
#[derive(Clone)]
pub struct IndexWriterHandle {
    tx: mpsc::Sender<WriteMsg>,
}

type ApplyReply = Result<Vec<DocOutcome>, IndexError>;

enum WriteMsg {
    Apply {
        ops: Vec<IndexOp>,
        resp: oneshot::Sender<ApplyReply>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

struct PendingApply {
    ops: Vec<IndexOp>,
    resp: oneshot::Sender<ApplyReply>,
}

pub fn spawn_index_writer(index: Box<dyn SearchIndex>, config: WriterConfig) -> IndexWriterHandle {
    let (tx, mut rx) = mpsc::channel::<WriteMsg>(config.queue_bound.max(1));
    let index = Arc::new(Mutex::new(index));

    tokio::spawn(async move {
        let max_size = config.batch_max_size.max(1);
        let mut pending: Vec<PendingApply> = Vec::new();
        let mut buffered = 0usize;
        let mut deadline = Instant::now() + config.batch_max_wait;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        flush_pending(&index, &mut pending, max_size).await;
                        break;
                    };

                    match msg {
                        WriteMsg::Apply { ops, resp } => {
                            if ops.is_empty() {
                                let _ = resp.send(Ok(Vec::new()));
                            } else {
                                if pending.is_empty() {
                                    deadline = Instant::now() + config.batch_max_wait;
                                }
                                buffered += ops.len();
                                pending.push(PendingApply { ops, resp });

                                if buffered >= max_size {
                                    flush_pending(&index, &mut pending, max_size).await;
                                    buffered = 0;
                                }
                            }
                        }
                        WriteMsg::Shutdown { resp } => {
                            flush_pending(&index, &mut pending, max_size).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !pending.is_empty() => {
                    flush_pending(&index, &mut pending, max_size).await;
                    buffered = 0;
                }
            }
        }
        debug!("index writer stopped");
    });

    IndexWriterHandle { tx }
}

impl IndexWriterHandle {
    /// Applies one write.
    pub async fn apply(&self, op: IndexOp) -> Result<Ack, IndexError> {
        let key = op.key().clone();
        let mut outcomes = self.apply_batch(vec![op]).await?;
        match outcomes.pop() {
            Some(DocOutcome::Applied) => Ok(Ack { key }),
            Some(DocOutcome::Rejected { reason }) => Err(IndexError::Rejected { key, reason }),
            None => Err(IndexError::Unavailable("writer returned no outcome".to_string())),
        }
    }

    /// Applies `ops` in order and returns one outcome per op.
    pub async fn apply_batch(&self, ops: Vec<IndexOp>) -> Result<Vec<DocOutcome>, IndexError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WriteMsg::Apply { ops, resp: tx })
            .await
            .map_err(|_| IndexError::ChannelClosed)?;
        rx.await.map_err(|_| IndexError::ChannelClosed)?
    }

    /// Flushes whatever is buffered and stops the writer task.
    pub async fn shutdown(&self) -> Result<(), IndexError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WriteMsg::Shutdown { resp: tx })
            .await
            .map_err(|_| IndexError::ChannelClosed)?;
        rx.await.map_err(|_| IndexError::ChannelClosed)
    }
}

async fn flush_pending(
    index: &Arc<Mutex<Box<dyn SearchIndex>>>,
    pending: &mut Vec<PendingApply>,
    max_size: usize,
) {
    if pending.is_empty() {
        return;
    }

    let requests = std::mem::take(pending);
    let mut ops = Vec::new();
    let mut spans = Vec::with_capacity(requests.len());
    let mut replies = Vec::with_capacity(requests.len());
    for req in requests {
        let start = ops.len();
        ops.extend(req.ops);
        spans.push((start, ops.len()));
        replies.push(req.resp);
    }
    let total = ops.len();

    let index_ref = Arc::clone(index);
    let (outcomes, failure) = match tokio::task::spawn_blocking(move || {
        let mut index = index_ref.blocking_lock();
        let mut outcomes = Vec::with_capacity(ops.len());
        for chunk in ops.chunks(max_size) {
            match apply_chunk(&mut **index, chunk) {
                Ok(mut chunk_out) => outcomes.append(&mut chunk_out),
                Err(err) => return (outcomes, Some(err)),
            }
        }
        (outcomes, None)
    })
    .await
    {
        Ok(result) => result,
        Err(e) => (Vec::new(), Some(IndexError::Unavailable(format!("join error: {e}")))),
    };

    match &failure {
        Some(err) => warn!(ops = total, written = outcomes.len(), error = %err, "index bulk failed"),
        None => debug!(ops = total, callers = spans.len(), "index batch flushed"),
    }

    for ((start, end), resp) in spans.into_iter().zip(replies) {
        let reply = if end <= outcomes.len() {
            Ok(outcomes[start..end].to_vec())
        } else {
            Err(failure
                .clone()
                .unwrap_or_else(|| IndexError::Unavailable("bulk ended early".to_string())))
        };
        let _ = resp.send(reply);
    }
}

fn apply_chunk(index: &mut dyn SearchIndex, chunk: &[IndexOp]) -> Result<Vec<DocOutcome>, IndexError> {
    match index.bulk(chunk) {
        Ok(out) if out.len() == chunk.len() => Ok(out),
        Ok(out) => Err(IndexError::Unavailable(format!(
            "bulk returned {} outcomes for {} ops",
            out.len(),
            chunk.len()
        ))),
        // A whole-request refusal does not say which document was bad;
        // replay the chunk one document at a time to find out.
        Err(IndexError::Rejected { .. }) => {
            let mut out = Vec::with_capacity(chunk.len());
            for op in chunk {
                let result = match op {
                    IndexOp::Upsert(doc) => index.upsert(doc),
                    IndexOp::Delete(key) => index.delete(key),
                };
                match result {
                    Ok(outcome) => out.push(outcome),
                    Err(IndexError::Rejected { reason, .. }) => out.push(DocOutcome::Rejected { reason }),
                    Err(err) => return Err(err),
                }
            }
            Ok(out)
        }
        Err(err) => Err(err),
    }
}
