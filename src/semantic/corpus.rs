//! Corpus payloads: fetching, decoding and the id → text lookup.
//!
//! Two payloads exist per granularity:
//! - embeddings: `{"embeddings": [{"id": ..., "embedding": [...]}, ...]}`
//! - text: `[{"text", "ref", "book", "chapter", "verseNum", "events", "entities"}, ...]`
//!
//! Embedding payloads may be gzip compressed; they are detected by magic
//! bytes rather than by headers because the hosting gateway does not set
//! `Content-Encoding`.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::semantic::cache::PayloadCache;
use crate::storage::{BackendLocal, StorageManager};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unit of retrieval. Each granularity has its own index and lookup.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Verse,
    Chapter,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::Verse, Granularity::Chapter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Verse => "verse",
            Granularity::Chapter => "chapter",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown granularity: {0}")]
pub struct UnknownGranularity(pub String);

impl FromStr for Granularity {
    type Err = UnknownGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "verse" => Ok(Granularity::Verse),
            "chapter" => Ok(Granularity::Chapter),
            _ => Err(UnknownGranularity(s.to_string())),
        }
    }
}

/// Where the payloads for one granularity live.
#[derive(Debug, Clone)]
pub struct SourceUrls {
    pub embeddings: String,
    /// Uncompressed copy, tried when `embeddings` fails
    pub embeddings_fallback: String,
    pub text: String,
}

/// Errors raised while fetching or decoding corpus payloads.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("fetching {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to decompress {url}: {source}")]
    Decompress {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Anything that can produce a parsed JSON payload for a URL.
pub trait CorpusSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Value, LoadError>;
}

/// Fetches payloads over HTTP, optionally persisting them on disk.
///
/// One client serves every fetch so connections are pooled.
pub struct HttpCorpusSource {
    client: reqwest::blocking::Client,
    disk: Option<BackendLocal>,
}

impl HttpCorpusSource {
    pub fn new(timeout: Duration, disk: Option<BackendLocal>) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self { client, disk })
    }

    fn read_disk(&self, url: &str) -> Option<Value> {
        let disk = self.disk.as_ref()?;
        let key = disk_key(url);
        if !disk.exists(&key) {
            return None;
        }

        match disk.read(&key).map(|bytes| serde_json::from_slice(&bytes)) {
            Ok(Ok(value)) => {
                log::debug!("disk cache hit url={url}");
                Some(value)
            }
            Ok(Err(e)) => {
                log::warn!("discarding unreadable disk cache entry url={url} err={e}");
                None
            }
            Err(e) => {
                log::warn!("failed to read disk cache entry url={url} err={e}");
                None
            }
        }
    }

    fn write_disk(&self, url: &str, bytes: &[u8]) {
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.write(&disk_key(url), bytes) {
                log::warn!("failed to persist payload url={url} err={e}");
            }
        }
    }
}

impl CorpusSource for HttpCorpusSource {
    fn fetch(&self, url: &str) -> Result<Value, LoadError> {
        if let Some(value) = self.read_disk(url) {
            return Ok(value);
        }

        let fetch_err = |source| LoadError::Fetch {
            url: url.to_string(),
            source,
        };

        log::info!("fetching url={url}");
        let response = self.client.get(url).send().map_err(fetch_err)?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(LoadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().map_err(fetch_err)?;
        let bytes = decode_body(url, &body)?;

        let value = serde_json::from_slice(&bytes).map_err(|source| LoadError::Parse {
            what: "payload JSON",
            source,
        })?;

        self.write_disk(url, &bytes);
        Ok(value)
    }
}

/// File name for a URL's on-disk copy.
fn disk_key(url: &str) -> String {
    format!("{:x}.json", Sha256::digest(url.as_bytes()))
}

/// Gunzip the body when it starts with the gzip magic number.
fn decode_body(url: &str, body: &[u8]) -> Result<Vec<u8>, LoadError> {
    if !body.starts_with(&GZIP_MAGIC) {
        return Ok(body.to_vec());
    }

    let mut decoded = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut decoded)
        .map_err(|source| LoadError::Decompress {
            url: url.to_string(),
            source,
        })?;
    Ok(decoded)
}

#[derive(Debug, Deserialize)]
struct EmbeddingPayload {
    embeddings: Vec<EmbeddingRecord>,
}

/// One precomputed passage embedding.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub embedding: Vec<f32>,
}

/// Raw text record as it appears in the text payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextRecord {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub book: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub chapter: i64,
    #[serde(default, rename = "verseNum", deserialize_with = "lenient_int")]
    pub verse_num: i64,
    #[serde(default, deserialize_with = "string_list")]
    pub events: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub entities: Vec<String>,
}

/// Accept integers, floats and numeric strings; anything else is 0.
fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Keep the string members of an array and drop the rest.
fn string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// Metadata attached to a passage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub book: String,
    pub chapter: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verse_num: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<String>>,
}

/// Passage text plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TextChunk {
    pub text: String,
    pub meta: ChunkMeta,
}

impl From<TextRecord> for TextChunk {
    fn from(record: TextRecord) -> Self {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        let non_empty_list = |v: Vec<String>| Some(v).filter(|v| !v.is_empty());

        TextChunk {
            text: record.text.unwrap_or_default(),
            meta: ChunkMeta {
                reference: non_empty(record.reference),
                book: record.book.unwrap_or_default(),
                chapter: record.chapter,
                verse_num: Some(record.verse_num).filter(|&v| v != 0),
                events: non_empty_list(record.events),
                entities: non_empty_list(record.entities),
            },
        }
    }
}

/// Fields an alias key can be derived from.
struct AliasSource<'a> {
    reference: &'a str,
    book: &'a str,
    chapter: i64,
    verse: i64,
    position: usize,
    granularity: Granularity,
}

type AliasKey = fn(&AliasSource) -> String;

/// Compatibility shim: the embedding and text payloads were produced by
/// different tools and do not agree on an id scheme, so every text record
/// is registered under each id shape seen in the wild.
const ALIAS_KEYS: &[AliasKey] = &[
    alias_reference,
    alias_verse_colon,
    alias_chapter_colon,
    alias_granularity_position,
    alias_dotted,
    alias_underscored,
    alias_position,
    alias_v_position,
];

fn alias_reference(s: &AliasSource) -> String {
    s.reference.to_string()
}

fn alias_verse_colon(s: &AliasSource) -> String {
    format!("verse:{}:{}:{}", s.book, s.chapter, s.verse)
}

fn alias_chapter_colon(s: &AliasSource) -> String {
    format!("chapter:{}:{}", s.book, s.chapter)
}

fn alias_granularity_position(s: &AliasSource) -> String {
    format!("{}_{}", s.granularity, s.position)
}

fn alias_dotted(s: &AliasSource) -> String {
    format!("{}.{}.{}", s.book, s.chapter, s.verse)
}

fn alias_underscored(s: &AliasSource) -> String {
    format!("{}_{}_{}", s.book, s.chapter, s.verse)
}

fn alias_position(s: &AliasSource) -> String {
    s.position.to_string()
}

fn alias_v_position(s: &AliasSource) -> String {
    format!("v{}", s.position)
}

/// id → passage lookup with every alias pointing at the same chunk.
#[derive(Debug, Default)]
pub struct ChunkLookup {
    chunks: HashMap<String, Arc<TextChunk>>,
    records: usize,
}

impl ChunkLookup {
    pub fn build(records: Vec<TextRecord>, granularity: Granularity) -> Self {
        let mut chunks = HashMap::with_capacity(records.len() * ALIAS_KEYS.len());
        let total = records.len();

        for (position, record) in records.into_iter().enumerate() {
            let reference = record.reference.clone().unwrap_or_default();
            let book = record.book.clone().unwrap_or_default();
            let source = AliasSource {
                reference: &reference,
                book: &book,
                chapter: record.chapter,
                verse: record.verse_num,
                position,
                granularity,
            };
            let keys: Vec<String> = ALIAS_KEYS.iter().map(|alias| alias(&source)).collect();

            let chunk = Arc::new(TextChunk::from(record));
            for key in keys.into_iter().filter(|k| !k.is_empty()) {
                chunks.insert(key, chunk.clone());
            }
        }

        Self {
            chunks,
            records: total,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<TextChunk>> {
        self.chunks.get(id)
    }

    /// Number of text records the lookup was built from.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Number of registered keys, aliases included.
    #[cfg(test)]
    pub fn keys(&self) -> usize {
        self.chunks.len()
    }
}

/// Parsed payloads for one granularity.
pub struct CorpusData {
    pub embeddings: Vec<EmbeddingRecord>,
    pub lookup: ChunkLookup,
}

pub fn parse_embeddings(value: &Value) -> Result<Vec<EmbeddingRecord>, LoadError> {
    EmbeddingPayload::deserialize(value)
        .map(|payload| payload.embeddings)
        .map_err(|source| LoadError::Parse {
            what: "embedding payload",
            source,
        })
}

pub fn parse_text(value: &Value) -> Result<Vec<TextRecord>, LoadError> {
    Vec::<TextRecord>::deserialize(value).map_err(|source| LoadError::Parse {
        what: "text payload",
        source,
    })
}

/// Fetches payloads through the process-wide cache and parses them.
pub struct CorpusLoader {
    source: Arc<dyn CorpusSource>,
    cache: PayloadCache,
}

impl CorpusLoader {
    pub fn new(source: Arc<dyn CorpusSource>) -> Self {
        Self {
            source,
            cache: PayloadCache::new(),
        }
    }

    fn fetch(&self, url: &str) -> Result<Arc<Value>, LoadError> {
        self.cache.get_or_fetch(url, |url| self.source.fetch(url))
    }

    fn fetch_with_fallback(&self, primary: &str, fallback: &str) -> Result<Arc<Value>, LoadError> {
        match self.fetch(primary) {
            Ok(value) => Ok(value),
            Err(e) if fallback.is_empty() => Err(e),
            Err(e) => {
                log::warn!("url={primary} outcome=error err={e}, trying fallback");
                self.fetch(fallback)
            }
        }
    }

    /// Fetch and parse both payloads for `granularity`.
    pub fn load(&self, granularity: Granularity, urls: &SourceUrls) -> Result<CorpusData, LoadError> {
        let embeddings = self.fetch_with_fallback(&urls.embeddings, &urls.embeddings_fallback)?;
        let text = self.fetch(&urls.text)?;

        Ok(CorpusData {
            embeddings: parse_embeddings(&embeddings)?,
            lookup: ChunkLookup::build(parse_text(&text)?, granularity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use serde_json::json;
    use std::io::Write;

    fn john_3_16() -> Value {
        json!({
            "text": "For God so loved the world",
            "ref": "John 3:16",
            "book": "John",
            "chapter": 3,
            "verseNum": "16",
            "events": ["crucifixion", 7],
            "entities": ["God"]
        })
    }

    #[test]
    fn test_granularity_parse_and_display() {
        assert_eq!("verse".parse::<Granularity>().unwrap(), Granularity::Verse);
        assert_eq!("Chapter".parse::<Granularity>().unwrap(), Granularity::Chapter);
        assert!("book".parse::<Granularity>().is_err());
        assert_eq!(Granularity::Chapter.to_string(), "chapter");
        assert_eq!(Granularity::default(), Granularity::Verse);
    }

    #[test]
    fn test_parse_text_record() {
        let records = parse_text(&json!([john_3_16()])).unwrap();
        let chunk = TextChunk::from(records[0].clone());

        assert_eq!(chunk.text, "For God so loved the world");
        assert_eq!(chunk.meta.reference.as_deref(), Some("John 3:16"));
        assert_eq!(chunk.meta.chapter, 3);
        assert_eq!(chunk.meta.verse_num, Some(16));
        assert_eq!(chunk.meta.events, Some(vec!["crucifixion".to_string()]));
        assert_eq!(chunk.meta.entities, Some(vec!["God".to_string()]));
    }

    #[test]
    fn test_parse_text_tolerates_missing_and_null_fields() {
        let records = parse_text(&json!([
            { "text": "In the beginning", "book": "Genesis", "chapter": 1.0 },
            { "text": null, "ref": null, "chapter": "x", "verseNum": null }
        ]))
        .unwrap();

        let first = TextChunk::from(records[0].clone());
        assert_eq!(first.meta.chapter, 1);
        assert_eq!(first.meta.verse_num, None);
        assert_eq!(first.meta.reference, None);

        let second = TextChunk::from(records[1].clone());
        assert_eq!(second.text, "");
        assert_eq!(second.meta.chapter, 0);
    }

    #[test]
    fn test_parse_text_rejects_non_array() {
        let result = parse_text(&json!({ "verses": [] }));
        assert!(matches!(result, Err(LoadError::Parse { what: "text payload", .. })));
    }

    #[test]
    fn test_parse_embeddings() {
        let records = parse_embeddings(&json!({
            "embeddings": [
                { "id": "John 3:16", "embedding": [0.5, -0.25] },
                { "id": "John 3:17", "embedding": [1, 0] }
            ]
        }))
        .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "John 3:16");
        assert_eq!(records[1].embedding, vec![1.0, 0.0]);

        assert!(parse_embeddings(&json!({ "vectors": [] })).is_err());
        assert!(parse_embeddings(&json!({ "embeddings": [{ "id": 3 }] })).is_err());
    }

    #[test]
    fn test_alias_keys_share_one_chunk() {
        let records = parse_text(&json!([
            { "text": "first", "book": "Genesis", "chapter": 1, "verseNum": 1, "ref": "Genesis 1:1" },
            john_3_16()
        ]))
        .unwrap();
        let lookup = ChunkLookup::build(records, Granularity::Verse);

        let expected = [
            "John 3:16",
            "verse:John:3:16",
            "chapter:John:3",
            "verse_1",
            "John.3.16",
            "John_3_16",
            "1",
            "v1",
        ];
        let canonical = lookup.get("John 3:16").unwrap();
        for key in expected {
            let chunk = lookup.get(key).unwrap_or_else(|| panic!("missing alias {key}"));
            assert!(Arc::ptr_eq(chunk, canonical), "alias {key} points elsewhere");
        }

        assert_eq!(lookup.get("v0").unwrap().text, "first");
        assert_eq!(lookup.records(), 2);
        assert_eq!(lookup.keys(), 16);
    }

    #[test]
    fn test_empty_reference_is_not_registered() {
        let records = parse_text(&json!([{ "text": "x", "book": "Ruth", "chapter": 1 }])).unwrap();
        let lookup = ChunkLookup::build(records, Granularity::Chapter);

        assert!(lookup.get("").is_none());
        assert!(lookup.get("chapter_0").is_some());
        assert!(lookup.get("Ruth.1.0").is_some());
    }

    #[test]
    fn test_decode_body_detects_gzip() {
        let raw = br#"{"embeddings":[]}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        let gz = encoder.finish().unwrap();

        assert_eq!(decode_body("u", &gz).unwrap(), raw.to_vec());
        assert_eq!(decode_body("u", raw).unwrap(), raw.to_vec());

        let truncated = &gz[..gz.len() / 2];
        assert!(matches!(
            decode_body("u", truncated),
            Err(LoadError::Decompress { .. })
        ));
    }

    #[test]
    fn test_disk_cache_served_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let disk = BackendLocal::new(dir.path()).unwrap();
        // port 9 (discard) is never listening in test environments
        let url = "http://127.0.0.1:9/verses.json";
        disk.write(&disk_key(url), br#"{"embeddings":[]}"#).unwrap();

        let source = HttpCorpusSource::new(Duration::from_secs(1), Some(disk)).unwrap();
        let value = source.fetch(url).unwrap();
        assert_eq!(value, json!({ "embeddings": [] }));
    }

    #[test]
    fn test_unreachable_url_is_fetch_error() {
        let source = HttpCorpusSource::new(Duration::from_millis(500), None).unwrap();
        let result = source.fetch("http://127.0.0.1:9/missing.json");
        assert!(matches!(result, Err(LoadError::Fetch { .. })));
    }

    #[test]
    fn test_one_source_serves_disk_and_network_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let disk = BackendLocal::new(dir.path()).unwrap();
        let cached = "http://127.0.0.1:9/cached.json";
        disk.write(&disk_key(cached), b"[]").unwrap();

        let source = HttpCorpusSource::new(Duration::from_millis(500), Some(disk)).unwrap();
        for _ in 0..2 {
            assert_eq!(source.fetch(cached).unwrap(), json!([]));
            assert!(matches!(
                source.fetch("http://127.0.0.1:9/missing.json"),
                Err(LoadError::Fetch { .. })
            ));
        }
    }

    #[test]
    fn test_disk_key_is_stable() {
        assert_eq!(disk_key("a"), disk_key("a"));
        assert_ne!(disk_key("a"), disk_key("b"));
        assert!(disk_key("a").ends_with(".json"));
        assert_eq!(disk_key("a").len(), 64 + 5);
    }
}
