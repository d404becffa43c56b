//! Local embedding backend over a pre-built binary vector index.
//!
//! Layout: `[u32 num_vectors][u32 dimension]` little-endian, then
//! `num_vectors * dimension` little-endian f32 in row-major order. Row `i`
//! belongs to entry `i` of the companion JSON vocabulary array.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::embedding_provider::{EmbeddingBatch, EmbeddingProvider, ProviderError};
use crate::cache::normalize_key;

const HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vocabulary json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("index file too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("vocabulary has {vocab} words but index has {rows} vectors")]
    VocabMismatch { vocab: usize, rows: usize },
    #[error("row {row} has {actual} values, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    vocabulary: Vec<String>,
    lookup: HashMap<String, usize>,
    data: Vec<f32>,
}

impl VectorIndex {
    pub fn from_rows(vocabulary: Vec<String>, rows: Vec<Vec<f32>>) -> Result<Self, VectorIndexError> {
        if vocabulary.len() != rows.len() {
            return Err(VectorIndexError::VocabMismatch {
                vocab: vocabulary.len(),
                rows: rows.len(),
            });
        }
        let dimension = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * dimension);
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != dimension {
                return Err(VectorIndexError::RaggedRow {
                    row,
                    expected: dimension,
                    actual: values.len(),
                });
            }
            data.extend(values);
        }
        Ok(Self::assemble(dimension, vocabulary, data))
    }

    fn assemble(dimension: usize, vocabulary: Vec<String>, data: Vec<f32>) -> Self {
        let mut lookup = HashMap::with_capacity(vocabulary.len());
        for (i, word) in vocabulary.iter().enumerate() {
            // 归一化后重复的词保留第一个
            lookup.entry(normalize_key(word)).or_insert(i);
        }
        Self {
            dimension,
            vocabulary,
            lookup,
            data,
        }
    }

    pub fn from_bytes(bytes: &[u8], vocabulary: Vec<String>) -> Result<Self, VectorIndexError> {
        if bytes.len() < HEADER_LEN {
            return Err(VectorIndexError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let num_vectors = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let dimension = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

        let expected = num_vectors
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .unwrap_or(usize::MAX);
        if bytes.len() < expected {
            return Err(VectorIndexError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }
        if vocabulary.len() != num_vectors {
            return Err(VectorIndexError::VocabMismatch {
                vocab: vocabulary.len(),
                rows: num_vectors,
            });
        }

        let data = bytes[HEADER_LEN..expected]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self::assemble(dimension, vocabulary, data))
    }

    pub fn load(index_path: &Path, vocab_path: &Path) -> Result<Self, VectorIndexError> {
        let bytes = fs::read(index_path)?;
        let vocabulary: Vec<String> = serde_json::from_slice(&fs::read(vocab_path)?)?;
        let index = Self::from_bytes(&bytes, vocabulary)?;
        tracing::info!(
            vectors = index.len(),
            dimension = index.dimension,
            path = %index_path.display(),
            "Loaded vector index"
        );
        Ok(index)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        out.extend_from_slice(&(self.vocabulary.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn write_to(&self, index_path: &Path, vocab_path: &Path) -> Result<(), VectorIndexError> {
        for path in [index_path, vocab_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(index_path, self.to_bytes())?;
        fs::write(vocab_path, serde_json::to_vec(&self.vocabulary)?)?;
        Ok(())
    }

    pub fn get(&self, word: &str) -> Option<&[f32]> {
        let row = *self.lookup.get(&normalize_key(word))?;
        let start = row * self.dimension;
        self.data.get(start..start + self.dimension)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocabulary.is_empty()
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }
}

/// Out-of-vocabulary words come back as `None`.
#[derive(Debug, Clone)]
pub struct VectorIndexProvider {
    index: Arc<VectorIndex>,
}

impl VectorIndexProvider {
    pub fn new(index: Arc<VectorIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl EmbeddingProvider for VectorIndexProvider {
    fn name(&self) -> &str {
        "vector_index"
    }

    fn dimension(&self) -> usize {
        self.index.dimension()
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, ProviderError> {
        Ok(texts
            .iter()
            .map(|t| self.index.get(t).map(<[f32]>::to_vec))
            .collect())
    }
}
