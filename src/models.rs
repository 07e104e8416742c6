//! Core data models used throughout docchat.
//!
//! These types represent the documents, chunks, index entries, and
//! conversation turns that flow through ingestion, retrieval, and memory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Flat key/value metadata attached to an index entry.
pub type Metadata = BTreeMap<String, String>;

/// File formats with a registered reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Txt,
    Markdown,
    Csv,
}

impl DocumentFormat {
    /// Resolve a format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "text" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Markdown),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Txt => "txt",
            Self::Markdown => "md",
            Self::Csv => "csv",
        }
    }
}

/// A loaded document. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Document {
    /// SHA-256 hex digest of `source`.
    pub id: String,
    pub source: PathBuf,
    pub format: DocumentFormat,
    pub text: String,
}

impl Document {
    pub fn new(source: impl AsRef<Path>, format: DocumentFormat, text: impl Into<String>) -> Self {
        let source = source.as_ref().to_path_buf();
        Self {
            id: crate::chunk::sha256_hex(&source.to_string_lossy()),
            source,
            format,
            text: text.into(),
        }
    }
}

/// A window of a document's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// `"{document_id}:{index}"`.
    pub id: String,
    pub document_id: String,
    pub index: usize,
    /// Character offset of the first character.
    pub start: usize,
    /// Character offset one past the last character.
    pub end: usize,
    pub text: String,
    pub hash: String,
}

/// Entry submitted to a vector index. A missing embedding is computed on upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Metadata,
}

impl VectorEntry {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            embedding: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Entry as held by a store, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedEntry {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// Entry as read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    /// Insertion ordinal assigned by the store; kept on overwrite.
    pub seq: i64,
}

/// A query hit: the entry and its cosine distance (`1 - similarity`).
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub entry: StoredEntry,
    pub distance: f32,
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::InvalidParameter(format!("unknown role '{}'", other))),
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    /// Allocated by the memory store; `0` until persisted.
    pub id: i64,
    pub role: Role,
    pub content: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

impl ConversationTurn {
    /// A turn that has not been persisted yet.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            role,
            content: content.into(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A message handed to the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Token and cost figures for one exchange. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostEstimate {
    pub word_count: usize,
    pub token_count: usize,
    pub estimated_cost: f64,
}

impl fmt::Display for CostEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "words: {}, tokens: {}, cost: ${:.6}",
            self.word_count, self.token_count, self.estimated_cost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension("md"), Some(DocumentFormat::Markdown));
        assert_eq!(DocumentFormat::from_extension("pptx"), None);
    }

    #[test]
    fn document_id_is_stable() {
        let a = Document::new("docs/a.txt", DocumentFormat::Txt, "one");
        let b = Document::new("docs/a.txt", DocumentFormat::Txt, "two");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn role_roundtrip() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("bot".parse::<Role>().is_err());
    }

    #[test]
    fn cost_display_has_fixed_precision() {
        let est = CostEstimate {
            word_count: 3,
            token_count: 10,
            estimated_cost: 0.00002,
        };
        assert_eq!(est.to_string(), "words: 3, tokens: 10, cost: $0.000020");
    }
}
