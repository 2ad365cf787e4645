//! In-memory vector index with cosine similarity search.
//!
//! Stores passage embeddings in insertion order and answers exact top-k
//! queries by scanning every eligible entry:
//! - Insert with dimension checking
//! - Filtered or unfiltered search, ranked by cosine similarity
//! - Rough memory accounting for status reporting

use rayon::prelude::*;
use serde::Serialize;

/// A single ranked hit returned by an index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Passage ID as it appeared in the embedding payload
    pub id: String,
    /// Cosine similarity score (-1.0 to 1.0)
    pub similarity: f32,
}

/// Operations shared by the exact and quantized indexes.
///
/// Both variants rank with the same cosine similarity and stable tie-break,
/// so one can replace the other without callers noticing anything beyond
/// precision.
pub trait SimilarityIndex: Send + Sync {
    /// Expected vector dimensions.
    fn dimensions(&self) -> usize;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry. Fails when the vector length differs from `dimensions()`.
    fn add(&mut self, id: String, vector: Vec<f32>) -> Result<(), IndexError>;

    /// Top-k search restricted to ids accepted by `filter`.
    fn search_with_filter(
        &self,
        query: &[f32],
        k: usize,
        filter: &(dyn Fn(&str) -> bool + Sync),
    ) -> Vec<SearchHit>;

    /// Top-k search over every entry.
    fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        self.search_with_filter(query, k, &|_| true)
    }

    /// Estimated bytes held by vectors and ids.
    fn memory_footprint_bytes(&self) -> usize;
}

/// An entry in the vector index.
#[derive(Debug, Clone)]
struct VectorEntry {
    id: String,
    embedding: Vec<f32>,
}

/// Exact float32 index.
pub struct VectorIndex {
    entries: Vec<VectorEntry>,
    dimensions: usize,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: Vec::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            dimensions,
        }
    }

    /// Get the stored vector for an id, if present.
    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.embedding.as_slice())
    }
}

impl SimilarityIndex for VectorIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn add(&mut self, id: String, vector: Vec<f32>) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }

        self.entries.push(VectorEntry {
            id,
            embedding: vector,
        });
        Ok(())
    }

    fn search_with_filter(
        &self,
        query: &[f32],
        k: usize,
        filter: &(dyn Fn(&str) -> bool + Sync),
    ) -> Vec<SearchHit> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }

        // collect() on an indexed parallel iterator keeps insertion order
        let hits: Vec<SearchHit> = self
            .entries
            .par_iter()
            .filter(|entry| filter(&entry.id))
            .map(|entry| SearchHit {
                id: entry.id.clone(),
                similarity: cosine_similarity(query, &entry.embedding),
            })
            .collect();

        rank(hits, k)
    }

    fn memory_footprint_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.embedding.len() * std::mem::size_of::<f32>() + entry.id.len())
            .sum()
    }
}

/// Sort hits by similarity (highest first) and keep the top `k`.
///
/// `sort_by` is stable, so equal scores keep insertion order.
pub(crate) fn rank(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    hits.truncate(k);
    hits
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when the lengths differ, either vector has zero norm, or the
/// result overflows (components near `f32::MAX`).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let magnitude = l2_norm(a) * l2_norm(b);
    if magnitude == 0.0 {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let similarity = dot_product / magnitude;
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}
