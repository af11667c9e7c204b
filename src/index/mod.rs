//! Search index abstraction and batching writer.

/// In-memory search index.
pub mod memory;
/// Batching index writer task.
pub mod writer;

use crate::{
    document::{DocKey, SearchDocument},
    projector::Projection,
};

/// One write against the search index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    /// Insert or replace a whole document.
    Upsert(SearchDocument),
    /// Remove a document by id.
    Delete(DocKey),
}

impl IndexOp {
    /// Address of the affected document.
    pub fn key(&self) -> &DocKey {
        match self {
            IndexOp::Upsert(doc) => &doc.key,
            IndexOp::Delete(key) => key,
        }
    }
}

impl From<Projection> for IndexOp {
    fn from(value: Projection) -> Self {
        match value {
            Projection::Upsert(doc) => IndexOp::Upsert(doc),
            Projection::Tombstone(key) => IndexOp::Delete(key),
        }
    }
}

/// Per-document result of a write the index accepted as a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocOutcome {
    /// The index state now reflects the write.
    Applied,
    /// The index refused this document. Permanent.
    Rejected {
        /// Reason reported by the index.
        reason: String,
    },
}

/// Acknowledgement for a single applied write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Address of the written document.
    pub key: DocKey,
}

/// Index failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// Index unreachable. Transient: retry with backoff.
    #[error("search index unavailable: {0}")]
    Unavailable(String),
    /// The document was refused. Permanent: log and skip.
    #[error("document {key} rejected: {reason}")]
    Rejected {
        /// Refused document.
        key: DocKey,
        /// Reason reported by the index.
        reason: String,
    },
    /// The writer task is gone.
    #[error("index writer channel closed")]
    ChannelClosed,
}

impl IndexError {
    /// True when retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Unavailable(_))
    }
}

/// Document-oriented search index.
///
/// Upserts must be idempotent and deleting an absent id must succeed.
pub trait SearchIndex: Send {
    /// Inserts or replaces one document.
    fn upsert(&mut self, doc: &SearchDocument) -> Result<DocOutcome, IndexError>;

    /// Removes one document.
    fn delete(&mut self, key: &DocKey) -> Result<DocOutcome, IndexError>;

    /// Applies `ops` in order, returning one outcome per op.
    ///
    /// Refused documents are reported as [`DocOutcome::Rejected`]; `Err` is
    /// reserved for failures of the whole request.
    fn bulk(&mut self, ops: &[IndexOp]) -> Result<Vec<DocOutcome>, IndexError> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                IndexOp::Upsert(doc) => self.upsert(doc),
                IndexOp::Delete(key) => self.delete(key),
            };
            match result {
                Ok(outcome) => out.push(outcome),
                Err(IndexError::Rejected { reason, .. }) => out.push(DocOutcome::Rejected { reason }),
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}
