//! Error types shared by the retrieval engine.
//!
//! [`Error`] covers configuration, ingestion, indexing, and storage
//! failures. [`GenerationError`] is returned by [`ChatModel`](crate::llm::ChatModel)
//! implementations. The orchestrator wraps both into
//! [`ExchangeError`](crate::chat::ExchangeError) so callers can tell which
//! stage of an exchange failed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine outside of model generation.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration field is missing or invalid. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The document's extension has no reader.
    #[error("unsupported document format '{extension}': {}", path.display())]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// A reader exists for the format but the file could not be parsed.
    #[error("failed to extract text from {}: {message}", path.display())]
    Extraction { path: PathBuf, message: String },

    /// The index was built with a different embedding model or dimensionality.
    #[error("embedding model mismatch for index '{index}': index has {expected}, provider gives {found}")]
    EmbeddingModelMismatch {
        index: String,
        expected: String,
        found: String,
    },

    /// Chunking or query parameters rejected at call time.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A strict insert found entries that already exist.
    #[error("id conflict in index '{index}': {}", ids.join(", "))]
    IdConflict { index: String, ids: Vec<String> },

    /// The embedding provider failed or returned an unusable response.
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn embedding(err: impl std::fmt::Display) -> Self {
        Error::Embedding(err.to_string())
    }

    /// True for errors tied to a single document that ingestion may skip.
    pub fn is_document_local(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat { .. } | Error::Extraction { .. }
        )
    }
}

/// Failures from the language model collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Rate limit or exhausted quota (HTTP 429 after retries).
    #[error("rate limited or quota exceeded: {message}")]
    Quota {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Transport failure before a response was received.
    #[error("network error: {0}")]
    Network(String),

    /// The request was rejected as invalid (HTTP 4xx other than 429).
    #[error("invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    /// The provider failed (HTTP 5xx after retries).
    #[error("provider error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The model could not be constructed (missing key, bad settings).
    #[error("model unavailable: {0}")]
    Unavailable(String),
}

impl GenerationError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Quota { .. } | GenerationError::Network(_) | GenerationError::Api { .. }
        )
    }
}
