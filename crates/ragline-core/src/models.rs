//! Core data models that flow through ingestion and retrieval.
//!
//! The ingestion pipeline owns the lifecycle of [`SourceDocument`],
//! [`Chunk`] and [`Embedding`]; retrieval only produces the ephemeral
//! [`RetrievalResult`] / [`Retrieval`] types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Error;

/// Where a source document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Upload,
    Message,
    Url,
    Other,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Message => "message",
            Self::Url => "url",
            Self::Other => "other",
        }
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "message" => Ok(Self::Message),
            "url" => Ok(Self::Url),
            "other" => Ok(Self::Other),
            other => Err(Error::validation(format!(
                "unknown source kind '{}': use upload, message, url, or other",
                other
            ))),
        }
    }
}

/// Persisted processing status of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(format!(
                "unknown processing status '{}'",
                other
            ))),
        }
    }
}

/// One ingested unit of raw text.
///
/// `id` identifies this *version*; `external_id` identifies the source
/// across versions. Re-ingesting the same `external_id` supersedes the
/// previous version instead of appending to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub external_id: String,
    pub owner_scope: Option<String>,
    pub source_kind: SourceKind,
    pub raw_text: String,
    /// SHA-256 of `raw_text`.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
}

impl SourceDocument {
    pub fn new(
        external_id: impl Into<String>,
        owner_scope: Option<String>,
        source_kind: SourceKind,
        raw_text: impl Into<String>,
    ) -> Self {
        let raw_text = raw_text.into();
        Self {
            id: Uuid::new_v4().to_string(),
            external_id: external_id.into(),
            owner_scope,
            source_kind,
            content_hash: hash_text(&raw_text),
            raw_text,
            created_at: Utc::now(),
            processing_status: ProcessingStatus::Pending,
        }
    }
}

/// SHA-256 hex digest of a text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A contiguous passage of a source document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source_document_id: String,
    /// Position within the source, starting at 0.
    pub ordinal: u32,
    pub text: String,
    /// Byte offset into the source text (inclusive).
    pub start_offset: usize,
    /// Byte offset into the source text (exclusive).
    pub end_offset: usize,
    /// Copied from the parent document when the chunk is created.
    pub owner_scope: Option<String>,
}

impl Chunk {
    /// Deterministic chunk id: UUID v5 over `"{document_id}/{ordinal}"`.
    pub fn derive_id(document_id: &str, ordinal: u32) -> String {
        let name = format!("{}/{}", document_id, ordinal);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }
}

/// Vector representation of one chunk under one embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub id: String,
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub owner_scope: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Embedding {
    /// Build the embedding for `chunk`. The id is derived from the chunk id
    /// and model, so re-embedding under the same model replaces the row.
    pub fn for_chunk(chunk: &Chunk, model: &str, vector: Vec<f32>) -> Self {
        let name = format!("{}#{}", chunk.id, model);
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
            chunk_id: chunk.id.clone(),
            vector,
            model: model.to_string(),
            owner_scope: chunk.owner_scope.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Partition selector for retrieval.
///
/// There is no default: callers pass either an owner tag or the explicit
/// [`Scope::Unscoped`] marker on every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "owner", rename_all = "snake_case")]
pub enum Scope {
    Owner(String),
    Unscoped,
}

impl Scope {
    pub fn owner(tag: impl Into<String>) -> Self {
        Self::Owner(tag.into())
    }

    /// Whether a record tagged `owner_scope` is visible under this scope.
    /// Untagged records are only visible when unscoped.
    pub fn admits(&self, owner_scope: Option<&str>) -> bool {
        match self {
            Self::Unscoped => true,
            Self::Owner(tag) => owner_scope == Some(tag.as_str()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(tag) => write!(f, "owner:{}", tag),
            Self::Unscoped => f.write_str("unscoped"),
        }
    }
}

/// Which search leg(s) produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Semantic,
    Keyword,
    Both,
}

/// One ranked entry of a retrieval response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub source_document_id: String,
    pub ordinal: u32,
    pub text: String,
    /// Combined score in `[0.0, 1.0]`.
    pub score: f64,
    pub match_kind: MatchKind,
    /// 1-based position in the response.
    pub rank: usize,
    pub keyword_score: Option<f64>,
    pub semantic_score: Option<f64>,
}

/// Counts of results per [`MatchKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStats {
    pub keyword_only: usize,
    pub semantic_only: usize,
    pub both: usize,
}

impl MatchStats {
    pub fn from_results(results: &[RetrievalResult]) -> Self {
        let mut stats = Self::default();
        for r in results {
            match r.match_kind {
                MatchKind::Keyword => stats.keyword_only += 1,
                MatchKind::Semantic => stats.semantic_only += 1,
                MatchKind::Both => stats.both += 1,
            }
        }
        stats
    }

    pub fn total(&self) -> usize {
        self.keyword_only + self.semantic_only + self.both
    }
}

/// Reasons a retrieval returned reduced-quality results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// The query could not be embedded; results are keyword-only.
    EmbeddingUnavailable,
    KeywordTimedOut,
    SemanticTimedOut,
}

/// Full retrieval response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Retrieval {
    pub correlation_id: String,
    pub results: Vec<RetrievalResult>,
    pub match_stats: MatchStats,
    pub degradations: Vec<Degradation>,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// Structured result of ingesting one source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionOutcome {
    pub document_id: String,
    pub external_id: String,
    pub status: ProcessingStatus,
    pub chunks_created: usize,
    pub chunks_filtered: usize,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
}

impl IngestionOutcome {
    /// Passages produced by the chunker before filtering.
    pub fn total_passages(&self) -> usize {
        self.chunks_created + self.chunks_filtered
    }

    pub fn is_partial(&self) -> bool {
        self.chunks_failed > 0
    }
}
