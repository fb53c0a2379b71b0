//! Per-document ingestion state machine.
//!
//! ```text
//! pending -> chunking -> embedding -> storing -> processed
//!     \__________\___________\__________\_____-> failed
//! ```
//!
//! Each transition is a synchronous method that returns the next state and
//! the trace events it emitted. The application drives the machine from an
//! async task and performs the I/O (embedding calls, store writes) between
//! transitions, so the whole sequence is testable without a runtime.
//!
//! Per-chunk embedding failures do not fail the document: it ends
//! `processed` with a non-zero `chunks_failed`, and those chunks stay
//! keyword-searchable until a re-embedding pass succeeds.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::chunk::{plan_chunks, ChunkOptions};
use crate::embedding::EmbedError;
use crate::error::{Error, Result};
use crate::models::{Chunk, Embedding, IngestionOutcome, ProcessingStatus, SourceDocument};
use crate::trace::{TraceEvent, TracePayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Pending,
    Chunking,
    Embedding,
    Storing,
    Processed,
    Failed,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storing => "storing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: IngestState,
    pub events: Vec<TraceEvent>,
}

/// Reject documents that can never be ingested.
pub fn validate_document(doc: &SourceDocument) -> Result<()> {
    if doc.id.trim().is_empty() {
        return Err(Error::validation("document id must not be empty"));
    }
    if doc.external_id.trim().is_empty() {
        return Err(Error::validation("external_id must not be empty"));
    }
    if let Some(scope) = &doc.owner_scope {
        if scope.trim().is_empty() {
            return Err(Error::validation(
                "owner_scope must be non-empty when present",
            ));
        }
    }
    Ok(())
}

/// Drives one [`SourceDocument`] through ingestion.
#[derive(Debug)]
pub struct IngestMachine {
    document: SourceDocument,
    correlation_id: String,
    state: IngestState,
    chunks: Vec<Chunk>,
    chunks_filtered: usize,
    embeddings: Vec<Embedding>,
    chunks_failed: usize,
    created: Instant,
}

impl IngestMachine {
    pub fn new(document: SourceDocument, correlation_id: impl Into<String>) -> Result<Self> {
        validate_document(&document)?;
        Ok(Self {
            document,
            correlation_id: correlation_id.into(),
            state: IngestState::Pending,
            chunks: Vec::new(),
            chunks_filtered: 0,
            embeddings: Vec::new(),
            chunks_failed: 0,
            created: Instant::now(),
        })
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn document(&self) -> &SourceDocument {
        &self.document
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    /// Texts to hand to the embedding gateway, in chunk order.
    pub fn embedding_inputs(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.text.clone()).collect()
    }

    /// `pending -> chunking`. The event's duration is the time spent pending.
    pub fn start(&mut self) -> Result<Step> {
        self.expect(IngestState::Pending)?;
        let event = self.event(
            TracePayload::IngestStarted {
                document_id: self.document.id.clone(),
                external_id: self.document.external_id.clone(),
                owner_scope: self.document.owner_scope.clone(),
            },
            self.created.elapsed(),
        );
        Ok(self.advance(IngestState::Chunking, vec![event]))
    }

    /// Split the document and build chunk records. `chunking -> embedding`.
    pub fn chunk(&mut self, options: &ChunkOptions) -> Result<Step> {
        self.expect(IngestState::Chunking)?;
        options.validate()?;
        let started = Instant::now();

        let plan = plan_chunks(&self.document.raw_text, options);
        let mut chunks = Vec::with_capacity(plan.passages.len());
        for (ordinal, passage) in plan.passages.iter().enumerate() {
            let ordinal = u32::try_from(ordinal)
                .map_err(|_| Error::validation("document produced too many chunks"))?;
            chunks.push(Chunk {
                id: Chunk::derive_id(&self.document.id, ordinal),
                source_document_id: self.document.id.clone(),
                ordinal,
                text: passage.text.to_string(),
                start_offset: passage.start_offset,
                end_offset: passage.end_offset,
                owner_scope: self.document.owner_scope.clone(),
            });
        }
        for chunk in &chunks {
            self.check_scope(&chunk.id, chunk.owner_scope.as_deref())?;
        }

        self.chunks_filtered = plan.filtered_count;
        self.chunks = chunks;
        let event = self.event(
            TracePayload::Chunking {
                document_id: self.document.id.clone(),
                chunks_created: self.chunks.len(),
                chunks_filtered: self.chunks_filtered,
            },
            started.elapsed(),
        );
        Ok(self.advance(IngestState::Embedding, vec![event]))
    }

    /// Record per-chunk embedding results. `embedding -> storing`.
    ///
    /// `results` must line up with [`chunks`](Self::chunks). Failed items are
    /// counted and left without an embedding.
    pub fn embedded(
        &mut self,
        model: &str,
        results: Vec<std::result::Result<Vec<f32>, EmbedError>>,
        elapsed: Duration,
    ) -> Result<Step> {
        self.expect(IngestState::Embedding)?;
        if results.len() != self.chunks.len() {
            return Err(Error::validation(format!(
                "expected {} embedding results, got {}",
                self.chunks.len(),
                results.len()
            )));
        }

        let mut embeddings = Vec::with_capacity(results.len());
        let mut failed = 0;
        for (chunk, result) in self.chunks.iter().zip(results) {
            match result {
                Ok(vector) => embeddings.push(Embedding::for_chunk(chunk, model, vector)),
                Err(_) => failed += 1,
            }
        }
        for emb in &embeddings {
            self.check_scope(&emb.id, emb.owner_scope.as_deref())?;
        }

        self.embeddings = embeddings;
        self.chunks_failed = failed;
        let event = self.event(
            TracePayload::Embedding {
                document_id: Some(self.document.id.clone()),
                model: model.to_string(),
                requested: self.chunks.len(),
                embedded: self.embeddings.len(),
                failed,
            },
            elapsed,
        );
        Ok(self.advance(IngestState::Storing, vec![event]))
    }

    /// Chunks and embeddings are persisted and the version is live.
    /// `storing -> processed`.
    pub fn stored(&mut self, elapsed: Duration) -> Result<Step> {
        self.expect(IngestState::Storing)?;
        let storing = self.event(
            TracePayload::Storing {
                document_id: self.document.id.clone(),
                chunks_stored: self.chunks.len(),
                embeddings_stored: self.embeddings.len(),
            },
            elapsed,
        );
        let completed = TraceEvent::new(
            self.correlation_id.clone(),
            TracePayload::IngestCompleted {
                document_id: self.document.id.clone(),
                external_id: self.document.external_id.clone(),
                status: ProcessingStatus::Processed,
                chunks_failed: self.chunks_failed,
            },
        );
        self.document.processing_status = ProcessingStatus::Processed;
        Ok(self.advance(IngestState::Processed, vec![storing, completed]))
    }

    /// Abort from any non-terminal state. Terminal states are left untouched.
    pub fn fail(&mut self, error: &Error, elapsed: Duration) -> Step {
        if self.state.is_terminal() {
            return Step {
                state: self.state,
                events: Vec::new(),
            };
        }
        let mut events = Vec::new();
        if matches!(error, Error::Cancelled) {
            events.push(TraceEvent::new(
                self.correlation_id.clone(),
                TracePayload::Cancelled {
                    operation: "ingest".to_string(),
                },
            ));
        }
        events.push(self.event(
            TracePayload::IngestFailed {
                document_id: self.document.id.clone(),
                failed_stage: self.state.as_str().to_string(),
                error: error.to_string(),
            },
            elapsed,
        ));
        self.document.processing_status = ProcessingStatus::Failed;
        self.advance(IngestState::Failed, events)
    }

    pub fn outcome(&self) -> IngestionOutcome {
        IngestionOutcome {
            document_id: self.document.id.clone(),
            external_id: self.document.external_id.clone(),
            status: match self.state {
                IngestState::Processed => ProcessingStatus::Processed,
                IngestState::Failed => ProcessingStatus::Failed,
                _ => ProcessingStatus::Pending,
            },
            chunks_created: self.chunks.len(),
            chunks_filtered: self.chunks_filtered,
            chunks_embedded: self.embeddings.len(),
            chunks_failed: self.chunks_failed,
        }
    }

    fn expect(&self, expected: IngestState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "invalid ingest transition: document is {}, expected {}",
                self.state, expected
            )))
        }
    }

    fn check_scope(&self, record: &str, found: Option<&str>) -> Result<()> {
        if found == self.document.owner_scope.as_deref() {
            Ok(())
        } else {
            Err(Error::ScopeMismatch {
                record: record.to_string(),
                expected: self.document.owner_scope.clone(),
                found: found.map(str::to_string),
            })
        }
    }

    fn event(&self, payload: TracePayload, elapsed: Duration) -> TraceEvent {
        TraceEvent::new(self.correlation_id.clone(), payload).with_duration(elapsed)
    }

    fn advance(&mut self, next: IngestState, events: Vec<TraceEvent>) -> Step {
        self.state = next;
        Step {
            state: next,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use crate::trace::TraceStage;

    fn doc(text: &str, owner: Option<&str>) -> SourceDocument {
        SourceDocument::new("notes.md", owner.map(str::to_string), SourceKind::Upload, text)
    }

    fn opts() -> ChunkOptions {
        ChunkOptions {
            max_chars: 40,
            overlap_fraction: 0.0,
            min_chars: 4,
            lookback_fraction: 0.3,
        }
    }

    fn text() -> String {
        "First paragraph is here.\n\nSecond paragraph follows.\n\nThird one ends it.".to_string()
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut m = IngestMachine::new(doc(&text(), Some("alice")), "corr").unwrap();
        let step = m.start().unwrap();
        assert_eq!(step.state, IngestState::Chunking);
        assert_eq!(step.events.len(), 1);
        assert_eq!(step.events[0].stage(), TraceStage::IngestStarted);
        assert!(step.events[0].duration_ms.is_some());
        assert!(matches!(
            &step.events[0].payload,
            TracePayload::IngestStarted { owner_scope: Some(tag), .. } if tag == "alice"
        ));

        let step = m.chunk(&opts()).unwrap();
        assert_eq!(step.state, IngestState::Embedding);
        assert_eq!(step.events[0].stage(), TraceStage::Chunking);
        assert!(step.events[0].duration_ms.is_some());
        let n = m.chunks().len();
        assert!(n >= 2);
        assert!(m
            .chunks()
            .iter()
            .all(|c| c.owner_scope.as_deref() == Some("alice")));

        let results = (0..n).map(|i| Ok(vec![i as f32, 1.0])).collect();
        let step = m.embedded("m1", results, Duration::from_millis(5)).unwrap();
        assert_eq!(step.state, IngestState::Storing);
        assert_eq!(m.embeddings().len(), n);
        for (emb, chunk) in m.embeddings().iter().zip(m.chunks()) {
            assert_eq!(emb.chunk_id, chunk.id);
            assert_eq!(emb.model, "m1");
        }

        let step = m.stored(Duration::from_millis(1)).unwrap();
        assert_eq!(step.state, IngestState::Processed);
        let stages: Vec<TraceStage> = step.events.iter().map(|e| e.stage()).collect();
        assert_eq!(stages, vec![TraceStage::Storing, TraceStage::IngestCompleted]);

        let outcome = m.outcome();
        assert_eq!(outcome.status, ProcessingStatus::Processed);
        assert_eq!(outcome.chunks_created, n);
        assert_eq!(outcome.chunks_failed, 0);
    }

    #[test]
    fn test_partial_embedding_failure_still_processed() {
        let mut m = IngestMachine::new(doc(&text(), None), "corr").unwrap();
        m.start().unwrap();
        m.chunk(&opts()).unwrap();
        let n = m.chunks().len();
        let results = (0..n)
            .map(|i| {
                if i == 0 {
                    Err(EmbedError::Transient("timeout".into()))
                } else {
                    Ok(vec![1.0])
                }
            })
            .collect();
        m.embedded("m1", results, Duration::ZERO).unwrap();
        m.stored(Duration::ZERO).unwrap();
        let outcome = m.outcome();
        assert_eq!(outcome.status, ProcessingStatus::Processed);
        assert_eq!(outcome.chunks_failed, 1);
        assert_eq!(outcome.chunks_embedded, n - 1);
        assert!(outcome.is_partial());
    }

    #[test]
    fn test_out_of_order_transition_rejected() {
        let mut m = IngestMachine::new(doc("text", None), "corr").unwrap();
        let err = m.stored(Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(m.state(), IngestState::Pending);
    }

    #[test]
    fn test_result_count_mismatch_rejected() {
        let mut m = IngestMachine::new(doc(&text(), None), "corr").unwrap();
        m.start().unwrap();
        m.chunk(&opts()).unwrap();
        assert!(m.embedded("m1", Vec::new(), Duration::ZERO).is_err());
    }

    #[test]
    fn test_fail_from_any_stage() {
        let mut m = IngestMachine::new(doc(&text(), None), "corr").unwrap();
        m.start().unwrap();
        m.chunk(&opts()).unwrap();
        let step = m.fail(&Error::store("disk gone"), Duration::from_millis(3));
        assert_eq!(step.state, IngestState::Failed);
        match &step.events[0].payload {
            TracePayload::IngestFailed { failed_stage, .. } => {
                assert_eq!(failed_stage, "embedding")
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(m.outcome().status, ProcessingStatus::Failed);
        assert!(m.fail(&Error::store("again"), Duration::ZERO).events.is_empty());
    }

    #[test]
    fn test_cancel_emits_cancelled_event() {
        let mut m = IngestMachine::new(doc("text", None), "corr").unwrap();
        m.start().unwrap();
        let step = m.fail(&Error::Cancelled, Duration::ZERO);
        assert_eq!(step.events[0].stage(), TraceStage::Cancelled);
        assert_eq!(step.events[1].stage(), TraceStage::IngestFailed);
    }

    #[test]
    fn test_empty_document_processes_with_no_chunks() {
        let mut m = IngestMachine::new(doc("   ", None), "corr").unwrap();
        m.start().unwrap();
        m.chunk(&opts()).unwrap();
        assert!(m.chunks().is_empty());
        m.embedded("m1", Vec::new(), Duration::ZERO).unwrap();
        m.stored(Duration::ZERO).unwrap();
        assert_eq!(m.outcome().chunks_created, 0);
    }

    #[test]
    fn test_validation() {
        let mut bad = doc("x", None);
        bad.external_id = "  ".into();
        assert!(IngestMachine::new(bad, "c").is_err());
        let bad = doc("x", Some(""));
        assert!(IngestMachine::new(bad, "c").is_err());
    }
}
