//! Storage abstraction for ragline.
//!
//! The [`Store`] trait is the key-indexed record store the ingestion pipeline
//! writes to and the searchers read from. Implementations are treated as
//! externally synchronized: each call is atomic on its own, and this crate
//! adds no locking over stored records.
//!
//! # Visibility
//!
//! Every ingestion writes a fresh document *version*. Its chunks are
//! invisible to readers until [`Store::activate`] makes that version the live
//! one for its `external_id`. Activation happens only after chunks and their
//! successful embeddings are persisted, so a reader never sees a chunk in a
//! state that claims semantic coverage it does not have. Superseded versions
//! stay in the store but drop out of every read path below.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Chunk, Embedding, ProcessingStatus, Scope, SourceDocument};

/// A chunk returned by [`Store::similarity_search`] with its raw cosine.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk: Chunk,
    pub similarity: f64,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put_document`](Store::put_document) | Insert a document version |
/// | [`set_status`](Store::set_status) | Update a version's processing status |
/// | [`put_chunks`](Store::put_chunks) | Insert chunks of a version |
/// | [`put_embeddings`](Store::put_embeddings) | Insert or replace embeddings per `(chunk, model)` |
/// | [`activate`](Store::activate) | Make a version live for its external id |
/// | [`scan_by_scope`](Store::scan_by_scope) | All live chunks visible under a scope |
/// | [`similarity_search`](Store::similarity_search) | Cosine search over live embeddings of one model |
/// | [`chunks_missing_embedding`](Store::chunks_missing_embedding) | Live chunks with no embedding for a model |
/// | [`get_document`](Store::get_document) | Fetch a document version by id |
///
/// Backend failures are reported as [`Error::StoreUnavailable`](crate::Error::StoreUnavailable).
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_document(&self, doc: &SourceDocument) -> Result<()>;

    async fn set_status(&self, document_id: &str, status: ProcessingStatus) -> Result<()>;

    async fn put_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Replaces any existing embedding with the same `(chunk_id, model)`.
    async fn put_embeddings(&self, embeddings: &[Embedding]) -> Result<()>;

    /// Make `document_id` the live version of its `external_id`.
    ///
    /// Returns the id of the version it superseded, if any.
    async fn activate(&self, document_id: &str) -> Result<Option<String>>;

    async fn scan_by_scope(&self, scope: &Scope) -> Result<Vec<Chunk>>;

    /// Live chunks under `scope` whose embedding for `model` has cosine
    /// similarity `>= threshold` with `query`, best first, at most `top_k`.
    ///
    /// Embeddings of other models are never compared.
    async fn similarity_search(
        &self,
        query: &[f32],
        model: &str,
        scope: &Scope,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>>;

    /// Live chunks with no embedding for `model`, oldest document first.
    async fn chunks_missing_embedding(&self, model: &str, limit: usize) -> Result<Vec<Chunk>>;

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>>;
}

/// Descending similarity, then ascending ordinal, then ascending chunk id.
pub fn sort_vector_matches(matches: &mut [VectorMatch]) {
    matches.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.chunk.ordinal.cmp(&b.chunk.ordinal))
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}
