//! In-memory knowledge index with JSON persistence.
//!
//! Search is lexical: TF-IDF weighted cosine similarity between the query's
//! tokens and each chunk's tokens, restricted to chunks whose attributes
//! equal every requested filter. Scores tie-break on chunk id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::tagging::{chunk_attributes, document_attributes};
use crate::tokenize::tokenize;
use crate::{
    chunker, Chunk, IndexConfig, IndexError, Result, ATTR_DOCUMENT_TYPE,
};

pub const CHUNKS_FILE_VERSION_V1: &str = "voltstream_chunks_v1";

const INDEXED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

#[derive(Debug, Serialize, Deserialize)]
struct ChunksFile {
    version: String,
    chunks: Vec<Chunk>,
}

// ============================================================================
// Query / Result types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    /// Attribute name -> required value.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(attribute.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_name: String,
    pub score: f64,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub documents: usize,
    pub chunks: usize,
    /// Chunks dropped because their document was reloaded.
    pub replaced: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub terms: usize,
    pub by_type: BTreeMap<String, usize>,
}

// ============================================================================
// Index
// ============================================================================

#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk: Chunk,
    term_counts: BTreeMap<String, u32>,
}

impl IndexedChunk {
    fn new(chunk: Chunk) -> Self {
        let mut term_counts = BTreeMap::new();
        for token in tokenize(&chunk.text) {
            *term_counts.entry(token).or_insert(0) += 1;
        }
        Self { chunk, term_counts }
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeIndex {
    config: IndexConfig,
    entries: BTreeMap<String, IndexedChunk>,
    /// Document name -> chunk ids in chunk order.
    documents: BTreeMap<String, Vec<String>>,
    /// Term -> number of chunks containing it.
    doc_freq: BTreeMap<String, usize>,
}

impl KnowledgeIndex {
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.chunking.validate()?;
        Ok(Self {
            config,
            entries: BTreeMap::new(),
            documents: BTreeMap::new(),
            doc_freq: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// Chunks of one document, in order.
    pub fn chunks_for(&self, document: &str) -> Vec<&Chunk> {
        self.documents
            .get(document)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.entries.get(id).map(|e| &e.chunk))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All chunks, by document then chunk order.
    pub fn chunks(&self) -> Vec<&Chunk> {
        self.documents
            .keys()
            .flat_map(|doc| self.chunks_for(doc))
            .collect()
    }

    /// Replace everything indexed for `name` with the chunks of `text`.
    /// Returns the new chunk count.
    pub fn load_document(&mut self, name: &str, text: &str) -> usize {
        let removed = self.remove_document(name);

        let doc_attributes = document_attributes(name, text, &self.config);
        let pieces = chunker::split_text(text, &self.config.chunking);
        let mut ids = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.into_iter().enumerate() {
            let chunk = Chunk {
                chunk_id: format!("{name}::{index}"),
                document_name: name.to_string(),
                index,
                content_hash: format!("{:x}", Sha256::digest(piece.as_bytes())),
                attributes: chunk_attributes(&doc_attributes, &piece, &self.config),
                text: piece,
            };
            ids.push(chunk.chunk_id.clone());
            self.insert(IndexedChunk::new(chunk));
        }

        let count = ids.len();
        if count > 0 {
            self.documents.insert(name.to_string(), ids);
        }
        tracing::debug!(document = name, chunks = count, replaced = removed, "document indexed");
        count
    }

    /// Drop every chunk of `name`; returns how many were removed.
    pub fn remove_document(&mut self, name: &str) -> usize {
        let Some(ids) = self.documents.remove(name) else {
            return 0;
        };
        for id in &ids {
            if let Some(entry) = self.entries.remove(id) {
                for term in entry.term_counts.keys() {
                    if let Some(df) = self.doc_freq.get_mut(term) {
                        *df -= 1;
                        if *df == 0 {
                            self.doc_freq.remove(term);
                        }
                    }
                }
            }
        }
        ids.len()
    }

    fn insert(&mut self, entry: IndexedChunk) {
        for term in entry.term_counts.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.entries.insert(entry.chunk.chunk_id.clone(), entry);
    }

    /// Index every `.md`/`.txt` file under `dir`, named by relative path.
    pub fn load_dir(&mut self, dir: &Path) -> Result<LoadSummary> {
        if !dir.is_dir() {
            return Err(IndexError::MissingSource(dir.to_path_buf()));
        }

        let mut summary = LoadSummary::default();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let indexed = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| INDEXED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !indexed {
                continue;
            }

            let name = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let text = fs::read_to_string(path)?;
            summary.replaced += self.documents.get(&name).map_or(0, Vec::len);
            summary.chunks += self.load_document(&name, &text);
            summary.documents += 1;
        }

        tracing::info!(
            dir = %dir.display(),
            documents = summary.documents,
            chunks = summary.chunks,
            "document directory indexed"
        );
        Ok(summary)
    }

    // ========================================================================
    // Search
    // ========================================================================

    fn idf(&self, term: &str) -> f64 {
        let n = self.entries.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        ((1.0 + n) / (1.0 + df)).ln() + 1.0
    }

    pub fn search(&self, query: &SearchQuery) -> Vec<SearchHit> {
        let mut query_counts: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokenize(&query.text) {
            *query_counts.entry(token).or_insert(0) += 1;
        }
        if query_counts.is_empty() {
            return Vec::new();
        }

        let query_weights: BTreeMap<&str, f64> = query_counts
            .iter()
            .map(|(term, tf)| (term.as_str(), f64::from(*tf) * self.idf(term)))
            .collect();
        let query_norm = query_weights.values().map(|w| w * w).sum::<f64>().sqrt();

        let mut hits: Vec<SearchHit> = self
            .entries
            .values()
            .filter(|entry| {
                query
                    .filters
                    .iter()
                    .all(|(attr, value)| entry.chunk.attributes.get(attr) == Some(value))
            })
            .filter_map(|entry| {
                let dot: f64 = query_weights
                    .iter()
                    .filter_map(|(term, qw)| {
                        let tf = entry.term_counts.get(*term)?;
                        Some(qw * f64::from(*tf) * self.idf(term))
                    })
                    .sum();
                if dot <= 0.0 {
                    return None;
                }
                let chunk_norm = entry
                    .term_counts
                    .iter()
                    .map(|(term, tf)| {
                        let w = f64::from(*tf) * self.idf(term);
                        w * w
                    })
                    .sum::<f64>()
                    .sqrt();
                Some(SearchHit {
                    chunk_id: entry.chunk.chunk_id.clone(),
                    document_name: entry.chunk.document_name.clone(),
                    score: dot / (query_norm * chunk_norm),
                    text: entry.chunk.text.clone(),
                    attributes: entry.chunk.attributes.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(query.limit.unwrap_or(self.config.default_limit));
        hits
    }

    pub fn stats(&self) -> IndexStats {
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.entries.values() {
            if let Some(doc_type) = entry.chunk.attributes.get(ATTR_DOCUMENT_TYPE) {
                *by_type.entry(doc_type.clone()).or_default() += 1;
            }
        }
        IndexStats {
            documents: self.documents.len(),
            chunks: self.entries.len(),
            terms: self.doc_freq.len(),
            by_type,
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write `chunks.json`-style output (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = ChunksFile {
            version: CHUNKS_FILE_VERSION_V1.to_string(),
            chunks: self.chunks().into_iter().cloned().collect(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a saved index. Chunk text is kept as saved; it is not re-split.
    pub fn open(path: &Path, config: IndexConfig) -> Result<Self> {
        if !path.exists() {
            return Err(IndexError::MissingSource(path.to_path_buf()));
        }
        let file: ChunksFile = serde_json::from_slice(&fs::read(path)?)?;
        if file.version != CHUNKS_FILE_VERSION_V1 {
            return Err(IndexError::Version(file.version));
        }

        let mut index = Self::new(config)?;
        for chunk in file.chunks {
            index
                .documents
                .entry(chunk.document_name.clone())
                .or_default()
                .push(chunk.chunk_id.clone());
            index.insert(IndexedChunk::new(chunk));
        }
        tracing::debug!(path = %path.display(), chunks = index.len(), "knowledge index opened");
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> KnowledgeIndex {
        KnowledgeIndex::new(IndexConfig::default()).unwrap()
    }

    #[test]
    fn reload_replaces_chunks() {
        let mut idx = index();
        assert_eq!(idx.load_document("a.md", "Dust on the LiDAR lens."), 1);
        assert_eq!(idx.load_document("a.md", "Dust on the LiDAR lens."), 1);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.stats().terms, 4);
    }

    #[test]
    fn empty_document_removes_previous_chunks() {
        let mut idx = index();
        idx.load_document("a.md", "Battery swap procedure.");
        assert_eq!(idx.load_document("a.md", "   "), 0);
        assert!(idx.is_empty());
        assert_eq!(idx.documents().count(), 0);
        assert_eq!(idx.stats().terms, 0);
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        let mut config = IndexConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(matches!(KnowledgeIndex::new(config), Err(IndexError::Config(_))));
    }

    #[test]
    fn query_without_tokens_finds_nothing() {
        let mut idx = index();
        idx.load_document("a.md", "Dust on the LiDAR lens.");
        assert!(idx.search(&SearchQuery::new("the a ?")).is_empty());
    }
}
