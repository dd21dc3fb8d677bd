use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// Knowledge base types
pub type DocumentId = u64;

/// Named structured attributes of a document, keyed by column name.
pub type StructuredFields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Category(String),
    Empty,
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Empty => true,
            FieldValue::Category(value) => value.is_empty(),
            FieldValue::Number(_) => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(value) => write!(f, "{}", value),
            FieldValue::Category(value) => f.write_str(value),
            FieldValue::Empty => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextField {
    pub name: String,
    pub value: String,
}

/// One normalized knowledge-base entity.
///
/// The rendered text lists the structured fields in ascending key order,
/// followed by the text fields in their declared order, one `name: value`
/// line each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub structured_fields: StructuredFields,
    pub text_fields: Vec<TextField>,
}

impl Document {
    pub fn render_text(&self) -> String {
        self.structured_fields
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .chain(
                self.text_fields
                    .iter()
                    .map(|field| format!("{}: {}", field.name, field.value)),
            )
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Identifies a chunk by its source document and position within it.
///
/// Ordering is lexicographic on `(document, sequence)`, which is the
/// tie-break order used when ranking equal scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub document: DocumentId,
    pub sequence: u32,
}

impl ChunkId {
    pub fn new(document: DocumentId, sequence: u32) -> Self {
        Self { document, sequence }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document, self.sequence)
    }
}

/// A contiguous span of a document's rendered text. Offsets count chars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub source_document_id: DocumentId,
    pub sequence_index: u32,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

// Query types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_text: String,
    pub k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: ChunkId,
    pub chunk_text: String,
    pub score: f32,
    pub source_document_id: DocumentId,
    pub structured_fields: StructuredFields,
}

// Error types
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Knowledge base source unavailable ({path}): {reason}")]
    SourceUnavailable { path: String, reason: String },

    #[error("Schema error{}{}: {reason}",
        .record.map(|r| format!(" in record {}", r)).unwrap_or_default(),
        .field.as_ref().map(|f| format!(" for field '{}'", f)).unwrap_or_default())]
    Schema {
        record: Option<DocumentId>,
        field: Option<String>,
        reason: String,
    },

    #[error("Invalid chunk config (window_size={window_size}, overlap={overlap}): {reason}")]
    InvalidChunkConfig {
        window_size: usize,
        overlap: usize,
        reason: String,
    },

    #[error("Embedder error: {0}")]
    Embedder(String),

    #[error("Embedding failed for chunk {chunk_id} after {attempts} attempts: {reason}")]
    EmbeddingFailure {
        chunk_id: ChunkId,
        attempts: u32,
        reason: String,
    },

    #[error("Dimension mismatch{}: expected {expected}, got {actual}",
        .chunk_id.map(|c| format!(" for chunk {}", c)).unwrap_or_default())]
    DimensionMismatch {
        chunk_id: Option<ChunkId>,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid vector{}: {reason}",
        .chunk_id.map(|c| format!(" for chunk {}", c)).unwrap_or_else(|| " in query".to_string()))]
    InvalidVector {
        chunk_id: Option<ChunkId>,
        reason: String,
    },

    #[error("Duplicate chunk id {0}")]
    DuplicateChunk(ChunkId),

    #[error("Index format error ({path}): {reason}")]
    IndexFormat { path: String, reason: String },

    #[error("Index persistence error ({path}): {reason}")]
    Persistence { path: String, reason: String },

    #[error("Index has not been built")]
    IndexNotBuilt,

    #[error("Query timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("Index build cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl KnowledgeError {
    pub fn schema(
        record: Option<DocumentId>,
        field: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        KnowledgeError::Schema {
            record,
            field: field.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Transient failures that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KnowledgeError::Embedder(_) | KnowledgeError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;
