//! Scalar-quantized vector index.
//!
//! Each vector is stored as centered int8 codes plus its own min and scale,
//! roughly a quarter of the float32 footprint. Search dequantizes stored
//! vectors on the fly and scores them against the full-precision query.

use rayon::prelude::*;

use crate::semantic::index::{cosine_similarity, rank, IndexError, SearchHit, SimilarityIndex};

/// Number of quantization steps between min and max.
const LEVELS: f32 = 255.0;
/// Shift from [0, 255] to the signed code range.
const CODE_OFFSET: f32 = 128.0;

/// Lossy int8 projection of a float32 vector.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedVector {
    pub codes: Vec<i8>,
    /// Width of one code step
    pub scale: f32,
    /// Smallest component of the source vector
    pub min: f32,
}

impl QuantizedVector {
    /// Min-max quantize a vector.
    ///
    /// A constant vector gets `scale = 1` so every code maps back to `min`.
    pub fn quantize(vector: &[f32]) -> Self {
        let Some(&first) = vector.first() else {
            return Self {
                codes: Vec::new(),
                scale: 1.0,
                min: 0.0,
            };
        };

        let (min, max) = vector
            .iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v)));

        let mut scale = (max - min) / LEVELS;
        if scale == 0.0 {
            scale = 1.0;
        }

        let codes = vector
            .iter()
            .map(|&v| {
                let code = ((v - min) / scale).round() - CODE_OFFSET;
                code.clamp(-128.0, 127.0) as i8
            })
            .collect();

        Self { codes, scale, min }
    }

    /// Reconstruct an approximation of the source vector.
    pub fn dequantize(&self) -> Vec<f32> {
        self.codes
            .iter()
            .map(|&code| self.min + (code as f32 + CODE_OFFSET) * self.scale)
            .collect()
    }

    /// Bytes used by the codes plus the scale and min.
    pub fn byte_size(&self) -> usize {
        self.codes.len() + 2 * std::mem::size_of::<f32>()
    }
}

struct QuantizedEntry {
    id: String,
    vector: QuantizedVector,
}

/// Memory-efficient drop-in for [`VectorIndex`](crate::semantic::VectorIndex).
pub struct QuantizedIndex {
    entries: Vec<QuantizedEntry>,
    dimensions: usize,
}

impl QuantizedIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: Vec::new(),
            dimensions,
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            dimensions,
        }
    }
}

impl SimilarityIndex for QuantizedIndex {
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

        self.entries.push(QuantizedEntry {
            id,
            vector: QuantizedVector::quantize(&vector),
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

        let hits: Vec<SearchHit> = self
            .entries
            .par_iter()
            .filter(|entry| filter(&entry.id))
            .map(|entry| SearchHit {
                id: entry.id.clone(),
                similarity: cosine_similarity(query, &entry.vector.dequantize()),
            })
            .collect();

        rank(hits, k)
    }

    fn memory_footprint_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.vector.byte_size() + entry.id.len())
            .sum()
    }
}
