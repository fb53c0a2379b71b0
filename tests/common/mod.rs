#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ragline::gateway::{EmbeddingGateway, GatewayConfig};
use ragline::ingest::Pipeline;
use ragline::retrieve::Retriever;
use ragline_core::chunk::ChunkOptions;
use ragline_core::embedding::{EmbedError, Embedder};
use ragline_core::models::{
    Chunk, Embedding, ProcessingStatus, Scope, SourceDocument, SourceKind,
};
use ragline_core::store::memory::InMemoryStore;
use ragline_core::store::{Store, VectorMatch};
use ragline_core::trace::TraceRecorder;

pub const TOPICS: [&str; 4] = ["rust", "python", "deploy", "garden"];
pub const MODEL: &str = "topic-v1";

/// Deterministic embedder: one dimension per topic word plus a small
/// constant so no vector is all zeros.
pub struct TopicEmbedder {
    pub calls: AtomicUsize,
    /// Texts containing "poison" are rejected.
    pub reject_poison: bool,
    /// Every call fails with a transient error.
    pub unavailable: bool,
    pub delay: Duration,
}

impl TopicEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            reject_poison: false,
            unavailable: false,
            delay: Duration::ZERO,
        }
    }

    pub fn rejecting_poison() -> Self {
        Self {
            reject_poison: true,
            ..Self::new()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = TOPICS
            .iter()
            .map(|t| lower.matches(t).count() as f32)
            .collect();
        v.push(0.1);
        v
    }
}

#[async_trait]
impl Embedder for TopicEmbedder {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dims(&self) -> usize {
        TOPICS.len() + 1
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unavailable {
            return Err(EmbedError::Transient("connection refused".into()));
        }
        if self.reject_poison && texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbedError::Invalid("rejected input".into()));
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        batch_size: 2,
        max_concurrency: 2,
        max_retries: 1,
        backoff_base: Duration::from_millis(1),
        call_timeout: Duration::from_secs(5),
    }
}

/// Passages of exactly 40 bytes with no overlap, so a document of `n`
/// paragraphs built with [`paragraphs`] yields exactly `n` chunks.
pub fn exact_options() -> ChunkOptions {
    ChunkOptions {
        max_chars: 40,
        overlap_fraction: 0.0,
        min_chars: 8,
        lookback_fraction: 0.3,
    }
}

/// Join bodies padded to 38 bytes with blank lines.
pub fn paragraphs(bodies: &[&str]) -> String {
    bodies
        .iter()
        .map(|b| {
            assert!(b.len() <= 38, "paragraph body too long: {}", b);
            format!("{:-<38}", b)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn doc(external_id: &str, owner: Option<&str>, text: &str) -> SourceDocument {
    SourceDocument::new(
        external_id,
        owner.map(str::to_string),
        SourceKind::Upload,
        text,
    )
}

/// Pipeline and retriever sharing one store, gateway, and recorder.
pub struct Harness {
    pub embedder: Arc<TopicEmbedder>,
    pub store: Arc<InMemoryStore>,
    pub recorder: Arc<TraceRecorder>,
    pub pipeline: Pipeline,
    pub retriever: Retriever,
}

impl Harness {
    pub fn new(embedder: TopicEmbedder) -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), embedder, exact_options())
    }

    pub fn with_options(embedder: TopicEmbedder, options: ChunkOptions) -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), embedder, options)
    }

    pub fn with_store(
        store: Arc<InMemoryStore>,
        embedder: TopicEmbedder,
        options: ChunkOptions,
    ) -> Self {
        let embedder = Arc::new(embedder);
        let recorder = Arc::new(TraceRecorder::new(500));
        let gateway = Arc::new(EmbeddingGateway::new(embedder.clone(), gateway_config()));
        let pipeline = Pipeline::new(store.clone(), gateway.clone(), recorder.clone(), options);
        let retriever = Retriever::new(
            store.clone(),
            gateway,
            recorder.clone(),
            Duration::from_secs(2),
        );
        Self {
            embedder,
            store,
            recorder,
            pipeline,
            retriever,
        }
    }
}

/// Delegates to an [`InMemoryStore`], sleeping before the chosen reads.
pub struct SlowStore {
    pub inner: InMemoryStore,
    pub scan_delay: Duration,
    pub similarity_delay: Duration,
}

#[async_trait]
impl Store for SlowStore {
    async fn put_document(&self, doc: &SourceDocument) -> ragline_core::Result<()> {
        self.inner.put_document(doc).await
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: ProcessingStatus,
    ) -> ragline_core::Result<()> {
        self.inner.set_status(document_id, status).await
    }

    async fn put_chunks(&self, chunks: &[Chunk]) -> ragline_core::Result<()> {
        self.inner.put_chunks(chunks).await
    }

    async fn put_embeddings(&self, embeddings: &[Embedding]) -> ragline_core::Result<()> {
        self.inner.put_embeddings(embeddings).await
    }

    async fn activate(&self, document_id: &str) -> ragline_core::Result<Option<String>> {
        self.inner.activate(document_id).await
    }

    async fn scan_by_scope(&self, scope: &Scope) -> ragline_core::Result<Vec<Chunk>> {
        tokio::time::sleep(self.scan_delay).await;
        self.inner.scan_by_scope(scope).await
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        model: &str,
        scope: &Scope,
        top_k: usize,
        threshold: f64,
    ) -> ragline_core::Result<Vec<VectorMatch>> {
        tokio::time::sleep(self.similarity_delay).await;
        self.inner
            .similarity_search(query, model, scope, top_k, threshold)
            .await
    }

    async fn chunks_missing_embedding(
        &self,
        model: &str,
        limit: usize,
    ) -> ragline_core::Result<Vec<Chunk>> {
        self.inner.chunks_missing_embedding(model, limit).await
    }

    async fn get_document(&self, id: &str) -> ragline_core::Result<Option<SourceDocument>> {
        self.inner.get_document(id).await
    }
}
