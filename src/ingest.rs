//! Ingestion pipeline: chunk → embed → store for one source document,
//! driven through [`IngestMachine`] so every stage emits a trace event.
//!
//! Writes happen in this order: the document version (pending, not yet
//! live), its chunks, its successful embeddings, the `processed` status, and
//! finally [`Store::activate`]. Readers only see chunks of live versions, so
//! a chunk becomes eligible for retrieval only once it and its embedding (if
//! any) are persisted, and re-ingesting an external id supersedes its
//! previous version instead of duplicating it.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ragline_core::chunk::ChunkOptions;
use ragline_core::lifecycle::IngestMachine;
use ragline_core::models::{Embedding, IngestionOutcome, ProcessingStatus, SourceDocument};
use ragline_core::store::Store;
use ragline_core::trace::{TraceEvent, TracePayload, TraceRecorder};
use ragline_core::{Error, Result};

use crate::cancel::CancelToken;
use crate::gateway::EmbeddingGateway;

/// Result of one re-embedding pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedPendingReport {
    pub correlation_id: String,
    pub requested: usize,
    pub embedded: usize,
    pub failed: usize,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    gateway: Arc<EmbeddingGateway>,
    recorder: Arc<TraceRecorder>,
    chunking: ChunkOptions,
    max_parallel_documents: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<EmbeddingGateway>,
        recorder: Arc<TraceRecorder>,
        chunking: ChunkOptions,
    ) -> Self {
        Self {
            store,
            gateway,
            recorder,
            chunking,
            max_parallel_documents: 4,
        }
    }

    pub fn with_max_parallel_documents(mut self, n: usize) -> Self {
        self.max_parallel_documents = n.max(1);
        self
    }

    /// Ingest one document.
    ///
    /// Per-chunk embedding failures are reported in the outcome. Only
    /// validation errors, store failures, scope violations, and cancellation
    /// are returned as `Err`; the last three also mark the document failed.
    pub async fn ingest(
        &self,
        doc: SourceDocument,
        cancel: &CancelToken,
    ) -> Result<IngestionOutcome> {
        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut machine = IngestMachine::new(doc, correlation_id)?;

        match self.drive(&mut machine, cancel).await {
            Ok(()) => {
                let outcome = machine.outcome();
                info!(
                    external_id = %outcome.external_id,
                    document_id = %outcome.document_id,
                    created = outcome.chunks_created,
                    filtered = outcome.chunks_filtered,
                    embedded = outcome.chunks_embedded,
                    failed = outcome.chunks_failed,
                    "ingested document"
                );
                Ok(outcome)
            }
            Err(err) => {
                let step = machine.fail(&err, started.elapsed());
                self.recorder.record_all(step.events);
                let document_id = machine.document().id.clone();
                if let Err(status_err) = self
                    .store
                    .set_status(&document_id, ProcessingStatus::Failed)
                    .await
                {
                    debug!(document_id = %document_id, error = %status_err, "could not mark document failed");
                }
                warn!(
                    external_id = %machine.document().external_id,
                    error = %err,
                    "ingestion failed"
                );
                Err(err)
            }
        }
    }

    async fn drive(&self, machine: &mut IngestMachine, cancel: &CancelToken) -> Result<()> {
        let step = machine.start()?;
        self.recorder.record_all(step.events);
        self.store.put_document(machine.document()).await?;
        cancel.check()?;

        let step = machine.chunk(&self.chunking)?;
        self.recorder.record_all(step.events);
        cancel.check()?;

        let embed_started = Instant::now();
        let results = self
            .gateway
            .embed_batch(&machine.embedding_inputs(), cancel)
            .await?;
        let step = machine.embedded(self.gateway.model(), results, embed_started.elapsed())?;
        self.recorder.record_all(step.events);
        cancel.check()?;

        let store_started = Instant::now();
        let document_id = machine.document().id.clone();
        self.store.put_chunks(machine.chunks()).await?;
        self.store.put_embeddings(machine.embeddings()).await?;
        self.store
            .set_status(&document_id, ProcessingStatus::Processed)
            .await?;
        if let Some(previous) = self.store.activate(&document_id).await? {
            debug!(document_id = %document_id, superseded = %previous, "superseded previous version");
        }
        let step = machine.stored(store_started.elapsed())?;
        self.recorder.record_all(step.events);
        Ok(())
    }

    /// Ingest independent documents concurrently, at most
    /// `max_parallel_documents` at a time. Results are in input order.
    pub async fn ingest_many(
        &self,
        docs: Vec<SourceDocument>,
        cancel: &CancelToken,
    ) -> Vec<Result<IngestionOutcome>> {
        stream::iter(docs)
            .map(|doc| self.ingest(doc, cancel))
            .buffered(self.max_parallel_documents)
            .collect()
            .await
    }

    /// Embed up to `limit` live chunks that have no embedding for the
    /// gateway's model. Successes become semantically searchable at once.
    pub async fn embed_pending(
        &self,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<EmbedPendingReport> {
        if !self.gateway.is_enabled() {
            return Err(Error::validation("embedding provider is disabled"));
        }
        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let model = self.gateway.model().to_string();

        let chunks = self.store.chunks_missing_embedding(&model, limit).await?;
        if chunks.is_empty() {
            return Ok(EmbedPendingReport {
                correlation_id,
                requested: 0,
                embedded: 0,
                failed: 0,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let results = match self.gateway.embed_batch(&texts, cancel).await {
            Ok(results) => results,
            Err(err) => {
                if matches!(err, Error::Cancelled) {
                    self.recorder.record(TraceEvent::new(
                        correlation_id,
                        TracePayload::Cancelled {
                            operation: "embed_pending".to_string(),
                        },
                    ));
                }
                return Err(err);
            }
        };

        let mut embeddings = Vec::with_capacity(chunks.len());
        let mut failed = 0;
        for (chunk, result) in chunks.iter().zip(results) {
            match result {
                Ok(vector) => embeddings.push(Embedding::for_chunk(chunk, &model, vector)),
                Err(e) => {
                    debug!(chunk_id = %chunk.id, error = %e, "chunk still unembedded");
                    failed += 1;
                }
            }
        }
        self.store.put_embeddings(&embeddings).await?;

        let report = EmbedPendingReport {
            correlation_id: correlation_id.clone(),
            requested: chunks.len(),
            embedded: embeddings.len(),
            failed,
        };
        self.recorder.record(
            TraceEvent::new(
                correlation_id,
                TracePayload::Embedding {
                    document_id: None,
                    model,
                    requested: report.requested,
                    embedded: report.embedded,
                    failed: report.failed,
                },
            )
            .with_duration(started.elapsed()),
        );
        info!(
            requested = report.requested,
            embedded = report.embedded,
            failed = report.failed,
            "re-embedding pass finished"
        );
        Ok(report)
    }
}
