//! Service and HTTP scenarios over an in-memory corpus.

mod web;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};

use serde_json::{json, Value};

use crate::semantic::{
    CorpusSource, EmbeddingChain, EmbeddingError, EmbeddingProvider, Granularity, LoadError,
    SearchService, SourceUrls,
};

pub const DIMS: usize = 4;

pub const VERSES: &str = "mem://verses.json.gz";
pub const VERSES_PLAIN: &str = "mem://verses.json";
pub const VERSE_TEXT: &str = "mem://verse-text.json";
pub const CHAPTERS: &str = "mem://chapters.json.gz";
pub const CHAPTERS_PLAIN: &str = "mem://chapters.json";
pub const CHAPTER_TEXT: &str = "mem://chapter-text.json";

/// Serves payloads from memory and counts every fetch per URL.
#[derive(Default)]
pub struct StubSource {
    payloads: RwLock<HashMap<String, Value>>,
    fetches: RwLock<HashMap<String, usize>>,
    total: AtomicUsize,
    gate: Mutex<Option<Arc<FetchGate>>>,
}

/// Holds one fetch open until the test lets it go.
pub struct FetchGate {
    entered: Barrier,
    release: Barrier,
}

impl FetchGate {
    /// Block until the held fetch has started.
    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    pub fn release(&self) {
        self.release.wait();
    }
}

impl StubSource {
    pub fn with_corpus() -> Arc<Self> {
        let source = Self::default();
        source.insert(VERSES, verse_embeddings());
        source.insert(VERSE_TEXT, verse_text());
        source.insert(CHAPTERS, chapter_embeddings());
        source.insert(CHAPTER_TEXT, chapter_text());
        Arc::new(source)
    }

    pub fn insert(&self, url: &str, payload: Value) {
        self.payloads
            .write()
            .unwrap()
            .insert(url.to_string(), payload);
    }

    pub fn remove(&self, url: &str) {
        self.payloads.write().unwrap().remove(url);
    }

    /// The next fetch blocks inside the source until [`FetchGate::release`].
    pub fn hold_next_fetch(&self) -> Arc<FetchGate> {
        let gate = Arc::new(FetchGate {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn fetches_of(&self, url: &str) -> usize {
        self.fetches.read().unwrap().get(url).copied().unwrap_or(0)
    }
}

impl CorpusSource for StubSource {
    fn fetch(&self, url: &str) -> Result<Value, LoadError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.wait();
            gate.release.wait();
        }

        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .fetches
            .write()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;

        self.payloads
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| LoadError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Always returns the same query vector.
pub struct FixedProvider(pub Vec<f32>);

impl EmbeddingProvider for FixedProvider {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.0.clone())
    }

    fn embed_document(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.0.clone())
    }
}

pub fn sources() -> HashMap<Granularity, SourceUrls> {
    HashMap::from([
        (
            Granularity::Verse,
            SourceUrls {
                embeddings: VERSES.to_string(),
                embeddings_fallback: VERSES_PLAIN.to_string(),
                text: VERSE_TEXT.to_string(),
            },
        ),
        (
            Granularity::Chapter,
            SourceUrls {
                embeddings: CHAPTERS.to_string(),
                embeddings_fallback: CHAPTERS_PLAIN.to_string(),
                text: CHAPTER_TEXT.to_string(),
            },
        ),
    ])
}

/// Service whose query vector is always `[1, 0, 0, 0]`.
pub fn fixed_service(source: Arc<StubSource>, quantized: bool) -> SearchService {
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(FixedProvider(vec![1.0, 0.0, 0.0, 0.0]));
    let chain = EmbeddingChain::from_providers(DIMS, vec![provider]);
    SearchService::new(Arc::new(chain), source, sources(), quantized)
}

/// Service with the model-less standard chain (precomputed, then hash).
pub fn standard_service(source: Arc<StubSource>) -> SearchService {
    let chain = EmbeddingChain::standard(DIMS, None);
    SearchService::new(Arc::new(chain), source, sources(), false)
}

pub fn verse_embeddings() -> Value {
    json!({
        "embeddings": [
            { "id": "John 3:16", "embedding": [1.0, 0.0, 0.0, 0.0] },
            { "id": "John 3:17", "embedding": [0.9, 0.1, 0.0, 0.0] },
            { "id": "Matthew 5:3", "embedding": [0.99, 0.01, 0.0, 0.0] },
            { "id": "Psalms 23:1", "embedding": [0.0, 1.0, 0.0, 0.0] },
            { "id": "orphan", "embedding": [0.0, 0.0, 1.0, 0.0] },
            { "id": "truncated", "embedding": [1.0, 0.0] }
        ]
    })
}

pub fn verse_text() -> Value {
    json!([
        {
            "text": "For God so loved the world",
            "ref": "John 3:16", "book": "John", "chapter": 3, "verseNum": 16
        },
        {
            "text": "For God sent not his Son into the world to condemn the world",
            "ref": "John 3:17", "book": "John", "chapter": "3", "verseNum": "17"
        },
        {
            "text": "Blessed are the poor in spirit",
            "ref": "Matthew 5:3", "book": "Matthew", "chapter": 5, "verseNum": 3,
            "entities": ["Jesus"]
        },
        {
            "text": "The Lord is my shepherd; I shall not want",
            "ref": "Psalms 23:1", "book": "Psalms", "chapter": 23, "verseNum": 1
        }
    ])
}

pub fn chapter_embeddings() -> Value {
    json!({
        "embeddings": [
            { "id": "chapter:John:3", "embedding": [1.0, 0.0, 0.0, 0.0] },
            { "id": "chapter:Psalms:23", "embedding": [0.0, 1.0, 0.0, 0.0] }
        ]
    })
}

pub fn chapter_text() -> Value {
    json!([
        { "text": "There was a man of the Pharisees", "book": "John", "chapter": 3 },
        { "text": "The Lord is my shepherd", "book": "Psalms", "chapter": 23 }
    ])
}
