//! Scripture search service.
//!
//! Owns one index and lookup per granularity and composes them with the
//! embedding chain:
//! - Lazy, idempotent per-granularity loading (`NotLoaded → Loading → Loaded`)
//! - Filtered top-k search joined back to passage text
//! - Status reporting for the boundary layer
//!
//! Fetching, parsing and index building run without the state lock; the
//! write lock is held only to flip a granularity's state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::semantic::chain::EmbeddingChain;
use crate::semantic::corpus::{
    ChunkLookup, ChunkMeta, CorpusData, CorpusLoader, CorpusSource, Granularity, LoadError,
    SourceUrls, UnknownGranularity,
};
use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::index::{IndexError, SearchHit, SimilarityIndex, VectorIndex};
use crate::semantic::quantized::QuantizedIndex;

/// Result count used when the caller asks for zero.
pub const DEFAULT_K: usize = 10;

/// What a preload call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// This call fetched and indexed the granularity.
    Loaded,
    AlreadyLoaded,
    /// Another caller is loading it; searches fail until that finishes.
    InProgress,
}

impl PreloadOutcome {
    /// Whether the granularity is searchable once this call returns.
    pub fn is_ready(self) -> bool {
        !matches!(self, PreloadOutcome::InProgress)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Granularity {0} not loaded")]
    NotLoaded(Granularity),

    #[error(transparent)]
    UnknownGranularity(#[from] UnknownGranularity),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Effective options for one search. Empty filters mean "accept all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub book: Option<String>,
    pub chapter: Option<String>,
    /// Applied to verse-granularity searches only
    pub verse: Option<String>,
    pub granularity: Granularity,
    /// 0 means [`DEFAULT_K`]
    pub k: usize,
}

/// Passage attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkView {
    pub id: String,
    pub text: String,
    pub meta: ChunkMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub similarity: f32,
    pub score: f32,
    pub chunk: ChunkView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GranularityStatus {
    pub loaded: bool,
    pub count: usize,
    pub memory_bytes: usize,
}

/// Index and lookup for one loaded granularity.
struct LoadedCorpus {
    index: Box<dyn SimilarityIndex>,
    lookup: ChunkLookup,
}

enum LoadState {
    NotLoaded,
    Loading,
    Loaded(Arc<LoadedCorpus>),
}

pub struct SearchService {
    chain: Arc<EmbeddingChain>,
    loader: CorpusLoader,
    sources: HashMap<Granularity, SourceUrls>,
    quantized: bool,
    states: RwLock<HashMap<Granularity, LoadState>>,
}

impl SearchService {
    pub fn new(
        chain: Arc<EmbeddingChain>,
        source: Arc<dyn CorpusSource>,
        sources: HashMap<Granularity, SourceUrls>,
        quantized: bool,
    ) -> Self {
        Self {
            chain,
            loader: CorpusLoader::new(source),
            sources,
            quantized,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn chain(&self) -> &Arc<EmbeddingChain> {
        &self.chain
    }

    pub fn is_loaded(&self, granularity: Granularity) -> bool {
        matches!(
            self.states
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&granularity),
            Some(LoadState::Loaded(_))
        )
    }

    /// Load a granularity by name. See [`SearchService::preload`].
    pub fn preload_granularity(&self, name: &str) -> Result<PreloadOutcome, SearchError> {
        self.preload(name.parse()?)
    }

    /// Fetch, parse and index one granularity.
    ///
    /// No-op when it is already loaded or another caller is loading it; the
    /// returned outcome tells the two apart. On failure the granularity goes
    /// back to `NotLoaded` and can be retried.
    pub fn preload(&self, granularity: Granularity) -> Result<PreloadOutcome, SearchError> {
        {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            match states.get(&granularity) {
                Some(LoadState::Loaded(_)) => {
                    log::info!("granularity={granularity} outcome=already_loaded");
                    return Ok(PreloadOutcome::AlreadyLoaded);
                }
                Some(LoadState::Loading) => {
                    log::info!("granularity={granularity} outcome=already_loading");
                    return Ok(PreloadOutcome::InProgress);
                }
                Some(LoadState::NotLoaded) | None => {
                    states.insert(granularity, LoadState::Loading);
                }
            }
        }

        let outcome = self.build(granularity);

        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(corpus) => {
                states.insert(granularity, LoadState::Loaded(Arc::new(corpus)));
                Ok(PreloadOutcome::Loaded)
            }
            Err(e) => {
                log::warn!("granularity={granularity} outcome=failed err={e}");
                states.insert(granularity, LoadState::NotLoaded);
                Err(e)
            }
        }
    }

    fn build(&self, granularity: Granularity) -> Result<LoadedCorpus, SearchError> {
        let urls = self.sources.get(&granularity).ok_or_else(|| {
            SearchError::Internal(format!("no sources configured for {granularity}"))
        })?;

        let started = Instant::now();
        let data = self.loader.load(granularity, urls)?;

        if granularity == Granularity::Verse {
            self.prime_fallback(&data);
        }

        let dimensions = self.chain.dimensions();
        let capacity = data.embeddings.len();
        let mut index: Box<dyn SimilarityIndex> = if self.quantized {
            Box::new(QuantizedIndex::with_capacity(dimensions, capacity))
        } else {
            Box::new(VectorIndex::with_capacity(dimensions, capacity))
        };

        let mut skipped = 0usize;
        for record in data.embeddings {
            let id = record.id.clone();
            if let Err(e) = index.add(record.id, record.embedding) {
                skipped += 1;
                log::warn!("granularity={granularity} id={id} outcome=skipped err={e}");
            }
        }

        log::info!(
            "granularity={granularity} outcome=loaded vectors={} skipped={skipped} records={} quantized={} elapsed_ms={}",
            index.len(),
            data.lookup.records(),
            self.quantized,
            started.elapsed().as_millis()
        );

        Ok(LoadedCorpus {
            index,
            lookup: data.lookup,
        })
    }

    /// Hand verse vectors and texts to the precomputed provider, in payload order.
    fn prime_fallback(&self, data: &CorpusData) {
        let Some(precomputed) = self.chain.precomputed() else {
            return;
        };

        let dimensions = self.chain.dimensions();
        let mut vectors = HashMap::with_capacity(data.embeddings.len());
        let mut texts = Vec::with_capacity(data.embeddings.len());

        for record in &data.embeddings {
            if record.embedding.len() != dimensions {
                continue;
            }
            if let Some(chunk) = data.lookup.get(&record.id) {
                if vectors
                    .insert(record.id.clone(), record.embedding.clone())
                    .is_none()
                {
                    texts.push((record.id.clone(), chunk.text.clone()));
                }
            }
        }

        precomputed.prime(vectors, texts);
    }

    fn loaded(&self, granularity: Granularity) -> Result<Arc<LoadedCorpus>, SearchError> {
        match self
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&granularity)
        {
            Some(LoadState::Loaded(corpus)) => Ok(Arc::clone(corpus)),
            _ => Err(SearchError::NotLoaded(granularity)),
        }
    }

    /// Ranked passages most similar to `query`.
    ///
    /// An empty query yields no results rather than an error.
    pub fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let k = if options.k == 0 { DEFAULT_K } else { options.k };
        let corpus = self.loaded(options.granularity)?;

        let vector = self.chain.embed_query(query)?;

        let filter = PassageFilter::new(options);
        let hits = if filter.is_empty() {
            corpus.index.search(&vector, k)
        } else {
            let lookup = &corpus.lookup;
            corpus.index.search_with_filter(&vector, k, &|id| {
                lookup.get(id).is_some_and(|chunk| filter.accepts(&chunk.meta))
            })
        };

        log::debug!(
            "granularity={} k={k} hits={} filtered={}",
            options.granularity,
            hits.len(),
            !filter.is_empty()
        );

        Ok(hits
            .into_iter()
            .map(|hit| join_chunk(hit, &corpus.lookup))
            .collect())
    }

    /// Per-granularity load state, count and footprint.
    pub fn status(&self) -> BTreeMap<Granularity, GranularityStatus> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);

        Granularity::ALL
            .iter()
            .map(|&granularity| {
                let status = match states.get(&granularity) {
                    Some(LoadState::Loaded(corpus)) => GranularityStatus {
                        loaded: true,
                        count: corpus.index.len(),
                        memory_bytes: corpus.index.memory_footprint_bytes(),
                    },
                    _ => GranularityStatus {
                        loaded: false,
                        count: 0,
                        memory_bytes: 0,
                    },
                };
                (granularity, status)
            })
            .collect()
    }
}

/// Metadata predicate built from search options.
struct PassageFilter<'a> {
    book: Option<&'a str>,
    chapter: Option<&'a str>,
    verse: Option<&'a str>,
}

impl<'a> PassageFilter<'a> {
    fn new(options: &'a SearchOptions) -> Self {
        let non_empty = |v: &'a Option<String>| v.as_deref().filter(|s| !s.is_empty());
        let verse = match options.granularity {
            Granularity::Verse => non_empty(&options.verse),
            Granularity::Chapter => None,
        };

        Self {
            book: non_empty(&options.book),
            chapter: non_empty(&options.chapter),
            verse,
        }
    }

    fn is_empty(&self) -> bool {
        self.book.is_none() && self.chapter.is_none() && self.verse.is_none()
    }

    fn accepts(&self, meta: &ChunkMeta) -> bool {
        if let Some(book) = self.book {
            if !meta.book.eq_ignore_ascii_case(book) {
                return false;
            }
        }
        if let Some(chapter) = self.chapter {
            if meta.chapter.to_string() != chapter {
                return false;
            }
        }
        if let Some(verse) = self.verse {
            if meta.verse_num.unwrap_or(0).to_string() != verse {
                return false;
            }
        }
        true
    }
}

fn join_chunk(hit: SearchHit, lookup: &ChunkLookup) -> SearchResult {
    let (text, meta) = match lookup.get(&hit.id) {
        Some(chunk) => (chunk.text.clone(), chunk.meta.clone()),
        None => (
            format!("[Text not found for ID: {}]", hit.id),
            ChunkMeta::default(),
        ),
    };

    SearchResult {
        similarity: hit.similarity,
        score: hit.similarity,
        chunk: ChunkView {
            id: hit.id.clone(),
            text,
            meta,
        },
        id: hit.id,
    }
}
