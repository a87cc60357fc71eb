//! Knowledge index for VoltStream maintenance documents
//!
//! Turns manuals, SOPs, and troubleshooting guides into:
//! - overlapping text chunks (section boundaries first, then paragraphs,
//!   lines, words)
//! - per-chunk attributes: document name and type, equipment model, and a
//!   best-effort error-code tag
//! - a lexical similarity index queried with attribute filters
//!
//! Reloading a document replaces its chunks, so repeated reloads never
//! duplicate content.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod chunker;
pub mod index;
pub mod tagging;
mod tokenize;

pub use chunker::split_text;
pub use index::{IndexStats, KnowledgeIndex, LoadSummary, SearchHit, SearchQuery};

/// Attribute names carried by every chunk.
pub const ATTR_DOCUMENT_NAME: &str = "document_name";
pub const ATTR_DOCUMENT_TYPE: &str = "document_type";
pub const ATTR_EQUIPMENT_MODEL: &str = "equipment_model";
pub const ATTR_ERROR_CODE_TAG: &str = "error_code_tag";

// ============================================================================
// Chunk representation
// ============================================================================

/// One indexed slice of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `"{document_name}::{index}"`
    pub chunk_id: String,
    pub document_name: String,
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex.
    pub content_hash: String,
    pub attributes: BTreeMap<String, String>,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Characters carried over from the end of the previous chunk.
    pub chunk_overlap: usize,
    /// Split points, coarsest first.
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1500,
            chunk_overlap: 200,
            separators: ["\n## ", "\n### ", "\n\n", "\n", " "]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(IndexError::Config("chunk_size must be positive".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IndexError::Config(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.separators.iter().any(String::is_empty) {
            return Err(IndexError::Config("separators must not be empty strings".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub chunking: ChunkingConfig,
    /// Codes looked for in chunk text, in priority order.
    pub error_codes: Vec<String>,
    /// Equipment models looked for in document text, in priority order.
    pub equipment_models: Vec<String>,
    /// Results returned when a query does not say.
    pub default_limit: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            error_codes: ["AGV-ERR-99", "AGV-ERR-01", "AGV-ERR-42", "AGV-ERR-55"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            equipment_models: ["SIMATIC-5000", "KMR-iiwa"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_limit: 5,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to walk document directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("document source not found: {}", .0.display())]
    MissingSource(PathBuf),
    #[error("invalid index configuration: {0}")]
    Config(String),
    #[error("unsupported index file version `{0}`")]
    Version(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;
