//! Trace events and the bounded, non-blocking trace recorder.
//!
//! Every pipeline stage emits a [`TraceEvent`] keyed by a correlation id
//! (one ingestion or one query). The [`TraceRecorder`] keeps the most recent
//! events in a fixed-capacity ring buffer: inserting past capacity evicts
//! the oldest event, and inserts run in constant time under a short lock so
//! the recorder never becomes backpressure for the pipeline it observes.
//!
//! Durable persistence is optional and external: a [`TraceTap`] is offered
//! each event before it is buffered and must not block. Hourly metrics are
//! computed by readers of the recorder, not by the recorder.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{Degradation, MatchStats, ProcessingStatus, Scope};

/// Default ring buffer capacity.
pub const DEFAULT_TRACE_CAPACITY: usize = 200;

/// Pipeline stage that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStage {
    IngestStarted,
    Chunking,
    Embedding,
    Storing,
    IngestCompleted,
    IngestFailed,
    KeywordSearch,
    SemanticSearch,
    Retrieval,
    Cancelled,
}

impl TraceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IngestStarted => "ingest_started",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storing => "storing",
            Self::IngestCompleted => "ingest_completed",
            Self::IngestFailed => "ingest_failed",
            Self::KeywordSearch => "keyword_search",
            Self::SemanticSearch => "semantic_search",
            Self::Retrieval => "retrieval",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TraceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TraceStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest_started" => Ok(Self::IngestStarted),
            "chunking" => Ok(Self::Chunking),
            "embedding" => Ok(Self::Embedding),
            "storing" => Ok(Self::Storing),
            "ingest_completed" => Ok(Self::IngestCompleted),
            "ingest_failed" => Ok(Self::IngestFailed),
            "keyword_search" => Ok(Self::KeywordSearch),
            "semantic_search" => Ok(Self::SemanticSearch),
            "retrieval" => Ok(Self::Retrieval),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation(format!("unknown trace stage '{}'", other))),
        }
    }
}

/// Min/max/mean of result scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl ScoreSummary {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        Some(Self { min, max, mean })
    }
}

/// Summary emitted once per retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub scope: Scope,
    pub result_count: usize,
    pub match_stats: MatchStats,
    pub scores: Option<ScoreSummary>,
    pub empty_result: bool,
    pub degradations: Vec<Degradation>,
}

/// Stage-specific payload. Small structured summaries only, never full text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum TracePayload {
    IngestStarted {
        document_id: String,
        external_id: String,
        owner_scope: Option<String>,
    },
    Chunking {
        document_id: String,
        chunks_created: usize,
        chunks_filtered: usize,
    },
    Embedding {
        document_id: Option<String>,
        model: String,
        requested: usize,
        embedded: usize,
        failed: usize,
    },
    Storing {
        document_id: String,
        chunks_stored: usize,
        embeddings_stored: usize,
    },
    IngestCompleted {
        document_id: String,
        external_id: String,
        status: ProcessingStatus,
        chunks_failed: usize,
    },
    IngestFailed {
        document_id: String,
        failed_stage: String,
        error: String,
    },
    KeywordSearch {
        scope: Scope,
        candidates: usize,
        timed_out: bool,
    },
    SemanticSearch {
        scope: Scope,
        candidates: usize,
        timed_out: bool,
        /// The query could not be embedded, so the store was not queried.
        skipped: bool,
    },
    Retrieval(RetrievalSummary),
    Cancelled {
        operation: String,
    },
}

impl TracePayload {
    pub fn stage(&self) -> TraceStage {
        match self {
            Self::IngestStarted { .. } => TraceStage::IngestStarted,
            Self::Chunking { .. } => TraceStage::Chunking,
            Self::Embedding { .. } => TraceStage::Embedding,
            Self::Storing { .. } => TraceStage::Storing,
            Self::IngestCompleted { .. } => TraceStage::IngestCompleted,
            Self::IngestFailed { .. } => TraceStage::IngestFailed,
            Self::KeywordSearch { .. } => TraceStage::KeywordSearch,
            Self::SemanticSearch { .. } => TraceStage::SemanticSearch,
            Self::Retrieval(_) => TraceStage::Retrieval,
            Self::Cancelled { .. } => TraceStage::Cancelled,
        }
    }
}

/// One immutable record of a stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    /// Set when the event marks a completed stage.
    pub duration_ms: Option<u64>,
    pub payload: TracePayload,
}

impl TraceEvent {
    pub fn new(correlation_id: impl Into<String>, payload: TracePayload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            duration_ms: None,
            payload,
        }
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn stage(&self) -> TraceStage {
        self.payload.stage()
    }
}

/// Non-blocking hand-off to an external persistence collaborator.
///
/// `offer` runs on the caller's hot path: it must return immediately and
/// may drop the event when its own queue is full.
pub trait TraceTap: Send + Sync {
    fn offer(&self, event: &TraceEvent);
}

/// Counters exposed by [`TraceRecorder::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub capacity: usize,
    pub buffered: usize,
    pub recorded: u64,
    pub evicted: u64,
}

/// Fixed-capacity FIFO of recent trace events, safe for concurrent writers.
pub struct TraceRecorder {
    capacity: usize,
    buffer: Mutex<VecDeque<TraceEvent>>,
    tap: Option<Arc<dyn TraceTap>>,
    recorded: AtomicU64,
    evicted: AtomicU64,
}

impl TraceRecorder {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            tap: None,
            recorded: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn with_tap(capacity: usize, tap: Arc<dyn TraceTap>) -> Self {
        Self {
            tap: Some(tap),
            ..Self::new(capacity)
        }
    }

    /// Fire-and-forget insert. Never fails and never waits on persistence.
    pub fn record(&self, event: TraceEvent) {
        if let Some(tap) = &self.tap {
            tap.offer(&event);
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_all(&self, events: impl IntoIterator<Item = TraceEvent>) {
        for event in events {
            self.record(event);
        }
    }

    /// Up to `limit` events, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<TraceEvent> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.iter().rev().take(limit).cloned().collect()
    }

    /// Buffered events for one correlation id, oldest first.
    pub fn correlated(&self, correlation_id: &str) -> Vec<TraceEvent> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            capacity: self.capacity,
            buffered: self.len(),
            recorded: self.recorded.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled(n: usize) -> TraceEvent {
        TraceEvent::new(
            format!("corr-{}", n),
            TracePayload::Cancelled {
                operation: format!("op-{}", n),
            },
        )
    }

    struct CountingTap(AtomicU64);

    impl TraceTap for CountingTap {
        fn offer(&self, _event: &TraceEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_capacity_plus_one_evicts_oldest() {
        let recorder = TraceRecorder::new(5);
        for i in 0..6 {
            recorder.record(cancelled(i));
        }
        assert_eq!(recorder.len(), 5);
        let recent = recorder.recent(10);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].correlation_id, "corr-5");
        assert_eq!(recent[4].correlation_id, "corr-1");
        assert!(recent.iter().all(|e| e.correlation_id != "corr-0"));
        assert_eq!(recorder.stats().evicted, 1);
        assert_eq!(recorder.stats().recorded, 6);
    }

    #[test]
    fn test_recent_respects_limit() {
        let recorder = TraceRecorder::new(10);
        for i in 0..4 {
            recorder.record(cancelled(i));
        }
        let recent = recorder.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].correlation_id, "corr-3");
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let recorder = TraceRecorder::new(0);
        recorder.record(cancelled(0));
        recorder.record(cancelled(1));
        assert_eq!(recorder.capacity(), 1);
        assert_eq!(recorder.recent(5)[0].correlation_id, "corr-1");
    }

    #[test]
    fn test_concurrent_writers() {
        let recorder = TraceRecorder::new(50);
        std::thread::scope(|s| {
            for t in 0..8 {
                let recorder = &recorder;
                s.spawn(move || {
                    for i in 0..100 {
                        recorder.record(cancelled(t * 1000 + i));
                    }
                });
            }
        });
        assert_eq!(recorder.len(), 50);
        assert_eq!(recorder.stats().recorded, 800);
        assert_eq!(recorder.stats().evicted, 750);
    }

    #[test]
    fn test_tap_sees_every_event() {
        let tap = Arc::new(CountingTap(AtomicU64::new(0)));
        let recorder = TraceRecorder::with_tap(2, tap.clone());
        for i in 0..5 {
            recorder.record(cancelled(i));
        }
        assert_eq!(tap.0.load(Ordering::Relaxed), 5);
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_correlated_filters() {
        let recorder = TraceRecorder::new(10);
        recorder.record(cancelled(1));
        recorder.record(cancelled(2));
        recorder.record(cancelled(1));
        assert_eq!(recorder.correlated("corr-1").len(), 2);
    }

    #[test]
    fn test_payload_serializes_with_stage_tag() {
        let event = TraceEvent::new(
            "c",
            TracePayload::KeywordSearch {
                scope: Scope::Unscoped,
                candidates: 3,
                timed_out: false,
            },
        )
        .with_duration(Duration::from_millis(12));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["stage"], "keyword_search");
        assert_eq!(json["payload"]["scope"]["kind"], "unscoped");
        assert_eq!(json["duration_ms"], 12);
        let back: TraceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.stage(), TraceStage::KeywordSearch);
    }

    #[test]
    fn test_score_summary() {
        assert!(ScoreSummary::from_scores(&[]).is_none());
        let s = ScoreSummary::from_scores(&[0.2, 0.6, 1.0]).unwrap();
        assert_eq!(s.min, 0.2);
        assert_eq!(s.max, 1.0);
        assert!((s.mean - 0.6).abs() < 1e-9);
    }
}
