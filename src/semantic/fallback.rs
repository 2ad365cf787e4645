//! Providers that work without a model.
//!
//! [`PrecomputedProvider`] borrows meaning from corpus embeddings whose text
//! overlaps the query. [`HashProvider`] is total and always produces a vector.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::semantic::index::l2_norm;

/// How many best-matching passages are averaged into a query vector.
const TOP_MATCHES: usize = 5;

/// Odd multiplier spreading the hash seed across dimensions.
const HASH_STEP: u32 = 2_654_435_761;

struct Primed {
    vectors: HashMap<String, Vec<f32>>,
    /// (id, lowercased text) in corpus order
    texts: Vec<(String, String)>,
}

/// Averages the stored vectors of the passages that best match the query text.
pub struct PrecomputedProvider {
    data: RwLock<Option<Primed>>,
    dimensions: usize,
}

impl PrecomputedProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: RwLock::new(None),
            dimensions,
        }
    }

    /// Replace the corpus this provider scores against.
    pub fn prime(&self, vectors: HashMap<String, Vec<f32>>, texts: Vec<(String, String)>) {
        let texts: Vec<(String, String)> = texts
            .into_iter()
            .map(|(id, text)| (id, text.to_lowercase()))
            .collect();
        log::info!("precomputed provider primed embeddings={}", vectors.len());

        *self.data.write().unwrap_or_else(PoisonError::into_inner) = Some(Primed { vectors, texts });
    }

    pub fn is_primed(&self) -> bool {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn best_matches<'a>(primed: &'a Primed, query: &str) -> Vec<&'a str> {
        let lowered = query.to_lowercase();
        let query_words: Vec<&str> = lowered.split_whitespace().collect();

        let mut scored: Vec<(&str, f64)> = primed
            .texts
            .iter()
            .map(|(id, text)| (id.as_str(), text_similarity(&query_words, text)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        // stable: equal scores keep corpus order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().take(TOP_MATCHES).map(|(id, _)| id).collect()
    }

    fn average(&self, primed: &Primed, ids: &[&str]) -> Vec<f32> {
        let mut result = vec![0.0f32; self.dimensions];
        let mut count = 0usize;

        for vector in ids.iter().filter_map(|id| primed.vectors.get(*id)) {
            for (slot, value) in result.iter_mut().zip(vector) {
                *slot += value;
            }
            count += 1;
        }

        if count > 0 {
            result.iter_mut().for_each(|v| *v /= count as f32);
        }
        result
    }
}

impl EmbeddingProvider for PrecomputedProvider {
    fn name(&self) -> &'static str {
        "precomputed"
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let primed = guard.as_ref().ok_or(EmbeddingError::NotPrimed)?;

        let matches = Self::best_matches(primed, text);
        if matches.is_empty() {
            return Err(EmbeddingError::NoMatches);
        }
        Ok(self.average(primed, &matches))
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_query(text)
    }
}

/// Share of query words found in the passage, plus a small bonus for longer passages.
///
/// A query word counts when it is a passage word, or when it contains or is
/// contained in one.
fn text_similarity(query_words: &[&str], passage: &str) -> f64 {
    if query_words.is_empty() {
        return 0.0;
    }

    let passage_words: Vec<&str> = passage.split_whitespace().collect();
    let word_set: HashSet<&str> = passage_words.iter().copied().collect();

    let matched = query_words
        .iter()
        .filter(|&&q| {
            word_set.contains(q) || word_set.iter().any(|w| w.contains(q) || q.contains(w))
        })
        .count();

    let ratio = matched as f64 / query_words.len() as f64;
    let length_bonus = ((passage_words.len() + 1) as f64).ln() / 10.0;
    ratio + length_bonus
}

/// Deterministic pseudo-embedding; never fails.
pub struct HashProvider {
    dimensions: usize,
    query_prefix: String,
    document_prefix: String,
}

impl HashProvider {
    pub fn new(
        dimensions: usize,
        query_prefix: impl Into<String>,
        document_prefix: impl Into<String>,
    ) -> Self {
        Self {
            dimensions,
            query_prefix: query_prefix.into(),
            document_prefix: document_prefix.into(),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        hash_embedding(text, self.dimensions)
    }
}

impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed(&format!("{}{}", self.query_prefix, text)))
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed(&format!("{}{}", self.document_prefix, text)))
    }
}

/// Base-31 rolling hash per char, spread per dimension, mapped to [-1, 1] and L2-normalized.
pub fn hash_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let hash = text
        .chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32));

    let raw: Vec<f32> = (0..dimensions)
        .map(|i| {
            let seed = hash.wrapping_add((i as u32).wrapping_mul(HASH_STEP));
            (seed as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect();

    normalize(raw)
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&vector);
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}
