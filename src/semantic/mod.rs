//! Semantic search over the scripture corpus.
//!
//! # Architecture
//!
//! - `embeddings`: provider capability, fastembed encoder, model-backed provider
//! - `fallback`: precomputed-average and hash providers
//! - `chain`: ordered provider fallback
//! - `index` / `quantized`: exact and int8 vector indexes
//! - `cache`: process-lifetime payload memo
//! - `corpus`: payload fetching, parsing and alias lookup
//! - `query`: inline filter parsing and option merging
//! - `service`: per-granularity loading and search

mod cache;
mod chain;
pub mod corpus;
pub mod embeddings;
mod fallback;
mod index;
mod quantized;
pub mod query;
mod service;

pub use chain::EmbeddingChain;
pub use corpus::{CorpusSource, Granularity, HttpCorpusSource, LoadError, SourceUrls};
pub use embeddings::{
    EmbeddingError, EmbeddingProvider, FastembedEncoder, ModelProvider, Readiness, TextEncoder,
};
pub use fallback::{HashProvider, PrecomputedProvider};
pub use index::{cosine_similarity, IndexError, SearchHit, SimilarityIndex, VectorIndex};
pub use quantized::{QuantizedIndex, QuantizedVector};
pub use service::{
    GranularityStatus, PreloadOutcome, SearchError, SearchOptions, SearchResult, SearchService,
    DEFAULT_K,
};
