//! The exposed surface: `ingest`, `retrieve`, `recent_traces`.
//!
//! [`Ragline`] wires a [`Store`], an [`Embedder`] and a [`TraceRecorder`]
//! into an ingestion [`Pipeline`] and a [`Retriever`] that share one
//! embedding gateway and one trace buffer.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use ragline_core::embedding::Embedder;
use ragline_core::models::{IngestionOutcome, Retrieval, Scope, SourceDocument};
use ragline_core::search::RetrievalOptions;
use ragline_core::store::Store;
use ragline_core::trace::{RecorderStats, TraceEvent, TraceRecorder};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::gateway::{EmbeddingGateway, GatewayConfig};
use crate::ingest::{EmbedPendingReport, Pipeline};
use crate::retrieve::Retriever;
use crate::sqlite_store::SqliteStore;
use crate::trace_sink::{spawn_trace_writer, SqliteTraceSink, TraceSink, TraceWriter, WriterConfig};
use crate::{db, embedding, migrate};

pub struct Ragline {
    pipeline: Pipeline,
    retriever: Retriever,
    recorder: Arc<TraceRecorder>,
    options: RetrievalOptions,
    writer: Option<TraceWriter>,
}

impl Ragline {
    /// Build from explicit collaborators.
    ///
    /// When `sink` is given, a background writer persists every recorded
    /// event; this must then be called from within a tokio runtime.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        sink: Option<Arc<dyn TraceSink>>,
    ) -> Result<Self> {
        let options = config.retrieval.to_options()?;
        options.validate()?;
        let chunking = config.chunking.to_options();
        chunking.validate()?;

        let (recorder, writer) = match sink {
            Some(sink) => {
                let (tap, writer) = spawn_trace_writer(sink, WriterConfig::from(&config.trace));
                (
                    TraceRecorder::with_tap(config.trace.capacity, tap),
                    Some(writer),
                )
            }
            None => (TraceRecorder::new(config.trace.capacity), None),
        };
        let recorder = Arc::new(recorder);
        let gateway = Arc::new(EmbeddingGateway::new(
            embedder,
            GatewayConfig::from(&config.embedding),
        ));

        let pipeline = Pipeline::new(
            store.clone(),
            gateway.clone(),
            recorder.clone(),
            chunking,
        )
        .with_max_parallel_documents(config.ingest.max_parallel_documents);
        let retriever = Retriever::new(
            store,
            gateway,
            recorder.clone(),
            config.retrieval.search_timeout(),
        );

        Ok(Self {
            pipeline,
            retriever,
            recorder,
            options,
            writer,
        })
    }

    /// Open the configured SQLite database, apply the schema, and build the
    /// configured embedding provider.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
        let embedder = embedding::create_provider(&config.embedding)?;
        let sink: Option<Arc<dyn TraceSink>> = if config.trace.persist {
            Some(Arc::new(SqliteTraceSink::new(pool)))
        } else {
            None
        };
        info!(
            db = %config.db.path.display(),
            provider = %config.embedding.provider,
            persist_traces = config.trace.persist,
            "engine ready"
        );
        Self::new(config, store, embedder, sink)
    }

    /// Retrieval options derived from the `[retrieval]` config section.
    pub fn default_options(&self) -> &RetrievalOptions {
        &self.options
    }

    pub async fn ingest(
        &self,
        doc: SourceDocument,
        cancel: &CancelToken,
    ) -> ragline_core::Result<IngestionOutcome> {
        self.pipeline.ingest(doc, cancel).await
    }

    pub async fn ingest_many(
        &self,
        docs: Vec<SourceDocument>,
        cancel: &CancelToken,
    ) -> Vec<ragline_core::Result<IngestionOutcome>> {
        self.pipeline.ingest_many(docs, cancel).await
    }

    pub async fn embed_pending(
        &self,
        limit: usize,
        cancel: &CancelToken,
    ) -> ragline_core::Result<EmbedPendingReport> {
        self.pipeline.embed_pending(limit, cancel).await
    }

    /// Retrieve with the configured options.
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &Scope,
        cancel: &CancelToken,
    ) -> ragline_core::Result<Retrieval> {
        self.retriever
            .retrieve(query, scope, &self.options, cancel)
            .await
    }

    pub async fn retrieve_with(
        &self,
        query: &str,
        scope: &Scope,
        options: &RetrievalOptions,
        cancel: &CancelToken,
    ) -> ragline_core::Result<Retrieval> {
        self.retriever.retrieve(query, scope, options, cancel).await
    }

    /// Most recent in-memory trace events, newest first.
    pub fn recent_traces(&self, limit: usize) -> Vec<TraceEvent> {
        self.recorder.recent(limit)
    }

    pub fn trace_stats(&self) -> RecorderStats {
        self.recorder.stats()
    }

    /// Flush pending trace writes and stop the background writer.
    pub async fn shutdown(self) {
        if let Some(writer) = self.writer {
            writer.shutdown().await;
        }
    }
}
