use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    document::{DocKey, SearchDocument},
    types::EntityType,
};

use super::{DocOutcome, IndexError, IndexOp, SearchIndex};

#[derive(Debug, Default)]
struct IndexState {
    docs: HashMap<DocKey, SearchDocument>,
    bulk_calls: usize,
    writes: usize,
}

/// In-memory search index. Clones share state, so a test can keep a clone
/// for inspection after boxing one into the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    state: Arc<Mutex<IndexState>>,
    max_doc_bytes: Option<usize>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects documents whose encoding exceeds `limit` bytes.
    pub fn with_max_doc_bytes(mut self, limit: usize) -> Self {
        self.max_doc_bytes = Some(limit);
        self
    }

    pub fn get(&self, key: &DocKey) -> Option<SearchDocument> {
        self.state.lock().docs.get(key).cloned()
    }

    pub fn contains(&self, key: &DocKey) -> bool {
        self.state.lock().docs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Documents of one index, sorted by id.
    pub fn documents(&self, index: EntityType) -> Vec<SearchDocument> {
        let mut docs: Vec<SearchDocument> = self
            .state
            .lock()
            .docs
            .values()
            .filter(|d| d.key.index == index)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.key.cmp(&b.key));
        docs
    }

    pub fn bulk_calls(&self) -> usize {
        self.state.lock().bulk_calls
    }

    /// Individual upserts and deletes applied so far.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    fn apply_upsert(&self, state: &mut IndexState, doc: &SearchDocument) -> Result<DocOutcome, IndexError> {
        if let Some(limit) = self.max_doc_bytes {
            let size = match doc.to_bytes() {
                Ok(bytes) => bytes.len(),
                Err(e) => return Ok(DocOutcome::Rejected { reason: e.to_string() }),
            };
            if size > limit {
                return Ok(DocOutcome::Rejected {
                    reason: format!("document is {size} bytes, limit is {limit}"),
                });
            }
        }
        state.docs.insert(doc.key.clone(), doc.clone());
        state.writes += 1;
        Ok(DocOutcome::Applied)
    }
}

impl SearchIndex for MemoryIndex {
    fn upsert(&mut self, doc: &SearchDocument) -> Result<DocOutcome, IndexError> {
        let mut state = self.state.lock();
        self.apply_upsert(&mut state, doc)
    }

    fn delete(&mut self, key: &DocKey) -> Result<DocOutcome, IndexError> {
        let mut state = self.state.lock();
        state.docs.remove(key);
        state.writes += 1;
        Ok(DocOutcome::Applied)
    }

    fn bulk(&mut self, ops: &[IndexOp]) -> Result<Vec<DocOutcome>, IndexError> {
        let mut state = self.state.lock();
        state.bulk_calls += 1;
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            out.push(match op {
                IndexOp::Upsert(doc) => self.apply_upsert(&mut state, doc)?,
                IndexOp::Delete(key) => {
                    state.docs.remove(key);
                    state.writes += 1;
                    DocOutcome::Applied
                }
            });
        }
        Ok(out)
    }
}
