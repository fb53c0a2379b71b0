//! Error taxonomy shared by ingestion and retrieval.
//!
//! Partial failures (some chunks not embedded, one search leg timed out) are
//! not errors; they are reported through `IngestionOutcome` counts and
//! `Retrieval::degradations`. Only the variants below abort an operation.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Malformed input. Never retried.
    #[error("validation error: {message}")]
    Validation { message: String },
    /// An external dependency (embedder, network) kept failing after the
    /// retry budget was spent.
    #[error("transient dependency failure: {message}")]
    TransientDependency { message: String },
    /// The caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// The storage layer itself failed; fatal for the current operation.
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },
    /// A record was about to be written with an owner scope that differs
    /// from its source document.
    #[error("scope mismatch for {record}: expected {expected:?}, found {found:?}")]
    ScopeMismatch {
        record: String,
        expected: Option<String>,
        found: Option<String>,
    },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientDependency {
            message: message.into(),
        }
    }

    /// Fatal errors abort a whole ingestion or query.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::ScopeMismatch { .. } | Self::Cancelled
        )
    }
}
