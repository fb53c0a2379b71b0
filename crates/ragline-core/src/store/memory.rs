//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Similarity search is
//! brute-force cosine over every live embedding of the requested model.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{Chunk, Embedding, ProcessingStatus, Scope, SourceDocument};

use super::{sort_vector_matches, Store, VectorMatch};

#[derive(Default)]
struct Inner {
    docs: HashMap<String, SourceDocument>,
    /// external_id -> live document version id
    live: HashMap<String, String>,
    /// Chunks in insertion order.
    chunks: Vec<Chunk>,
    /// (chunk_id, model) -> embedding
    embeddings: HashMap<(String, String), Embedding>,
    offline: bool,
}

impl Inner {
    fn is_live(&self, document_id: &str) -> bool {
        self.docs
            .get(document_id)
            .and_then(|doc| self.live.get(&doc.external_id))
            .is_some_and(|live_id| live_id == document_id)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline {
            Err(Error::store("in-memory store is offline"))
        } else {
            Ok(())
        }
    }
}

/// In-memory store. A poisoned lock is recovered rather than propagated.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable`, or restore it.
    pub fn set_offline(&self, offline: bool) {
        self.write().offline = offline;
    }

    /// Total stored chunks, including superseded versions.
    pub fn chunk_count(&self) -> usize {
        self.read().chunks.len()
    }

    /// Total stored embeddings, including superseded versions.
    pub fn embedding_count(&self) -> usize {
        self.read().embeddings.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_document(&self, doc: &SourceDocument) -> Result<()> {
        let mut inner = self.write();
        inner.check_online()?;
        inner.docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn set_status(&self, document_id: &str, status: ProcessingStatus) -> Result<()> {
        let mut inner = self.write();
        inner.check_online()?;
        match inner.docs.get_mut(document_id) {
            Some(doc) => {
                doc.processing_status = status;
                Ok(())
            }
            None => Err(Error::validation(format!(
                "unknown document '{}'",
                document_id
            ))),
        }
    }

    async fn put_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.write();
        inner.check_online()?;
        for chunk in chunks {
            if let Some(existing) = inner.chunks.iter_mut().find(|c| c.id == chunk.id) {
                *existing = chunk.clone();
            } else {
                inner.chunks.push(chunk.clone());
            }
        }
        Ok(())
    }

    async fn put_embeddings(&self, embeddings: &[Embedding]) -> Result<()> {
        let mut inner = self.write();
        inner.check_online()?;
        for emb in embeddings {
            inner
                .embeddings
                .insert((emb.chunk_id.clone(), emb.model.clone()), emb.clone());
        }
        Ok(())
    }

    async fn activate(&self, document_id: &str) -> Result<Option<String>> {
        let mut inner = self.write();
        inner.check_online()?;
        let external_id = match inner.docs.get(document_id) {
            Some(doc) => doc.external_id.clone(),
            None => {
                return Err(Error::validation(format!(
                    "unknown document '{}'",
                    document_id
                )))
            }
        };
        let previous = inner.live.insert(external_id, document_id.to_string());
        Ok(previous.filter(|id| id != document_id))
    }

    async fn scan_by_scope(&self, scope: &Scope) -> Result<Vec<Chunk>> {
        let inner = self.read();
        inner.check_online()?;
        Ok(inner
            .chunks
            .iter()
            .filter(|c| scope.admits(c.owner_scope.as_deref()))
            .filter(|c| inner.is_live(&c.source_document_id))
            .cloned()
            .collect())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        model: &str,
        scope: &Scope,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>> {
        let inner = self.read();
        inner.check_online()?;
        let mut matches: Vec<VectorMatch> = inner
            .chunks
            .iter()
            .filter(|c| scope.admits(c.owner_scope.as_deref()))
            .filter(|c| inner.is_live(&c.source_document_id))
            .filter_map(|c| {
                let emb = inner.embeddings.get(&(c.id.clone(), model.to_string()))?;
                let similarity = cosine_similarity(query, &emb.vector) as f64;
                (similarity >= threshold).then(|| VectorMatch {
                    chunk: c.clone(),
                    similarity,
                })
            })
            .collect();
        sort_vector_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn chunks_missing_embedding(&self, model: &str, limit: usize) -> Result<Vec<Chunk>> {
        let inner = self.read();
        inner.check_online()?;
        Ok(inner
            .chunks
            .iter()
            .filter(|c| inner.is_live(&c.source_document_id))
            .filter(|c| {
                !inner
                    .embeddings
                    .contains_key(&(c.id.clone(), model.to_string()))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>> {
        let inner = self.read();
        inner.check_online()?;
        Ok(inner.docs.get(id).cloned())
    }
}
