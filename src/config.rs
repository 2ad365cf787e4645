use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::{
    DEFAULT_DIMENSIONS, DEFAULT_MODEL, DOCUMENT_PREFIX, MAX_TOKENS, QUERY_PREFIX,
};
use crate::semantic::{Granularity, SourceUrls};
use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const VERSES_URL: &str = "https://arweave.net/DdKgzVD1zJDlFqcPKnOf620EviiU5LoGDqxrv5wxxUY";
const VERSES_UNCOMPRESSED_URL: &str =
    "https://arweave.net/uW8W0WE37IsmZuuH5NJxfrDLWjf_vFFK5v4MmzL2Gco";
const VERSE_TEXT_URL: &str = "https://arweave.net/daKtqqHpLRnAWCNEWY8Q92NwSyJxWbm7WFDE3ut_BuM";
const CHAPTERS_URL: &str = "https://arweave.net/RLfnXY9-kD9McjalEhGgcK3ZZH9G_dXcfh6unygV1s8";
const CHAPTERS_UNCOMPRESSED_URL: &str =
    "https://arweave.net/JyOVgeD6IlWnIg8e24cPQgEidAADriGexHbhZ0Hs6Fo";
// chapter records are served from the same text payload as verses
const CHAPTER_TEXT_URL: &str = VERSE_TEXT_URL;

/// Where the corpus payloads are hosted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorpusConfig {
    #[serde(default = "default_verses")]
    pub verses: String,
    #[serde(default = "default_verses_uncompressed")]
    pub verses_uncompressed: String,
    #[serde(default = "default_verse_text")]
    pub verse_text: String,
    #[serde(default = "default_chapters")]
    pub chapters: String,
    #[serde(default = "default_chapters_uncompressed")]
    pub chapters_uncompressed: String,
    #[serde(default = "default_chapter_text")]
    pub chapter_text: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            verses: default_verses(),
            verses_uncompressed: default_verses_uncompressed(),
            verse_text: default_verse_text(),
            chapters: default_chapters(),
            chapters_uncompressed: default_chapters_uncompressed(),
            chapter_text: default_chapter_text(),
        }
    }
}

impl CorpusConfig {
    pub fn urls_for(&self, granularity: Granularity) -> SourceUrls {
        match granularity {
            Granularity::Verse => SourceUrls {
                embeddings: self.verses.clone(),
                embeddings_fallback: self.verses_uncompressed.clone(),
                text: self.verse_text.clone(),
            },
            Granularity::Chapter => SourceUrls {
                embeddings: self.chapters.clone(),
                embeddings_fallback: self.chapters_uncompressed.clone(),
                text: self.chapter_text.clone(),
            },
        }
    }

    pub fn all_urls(&self) -> HashMap<Granularity, SourceUrls> {
        Granularity::ALL
            .iter()
            .map(|&g| (g, self.urls_for(g)))
            .collect()
    }
}

fn default_verses() -> String {
    VERSES_URL.to_string()
}

fn default_verses_uncompressed() -> String {
    VERSES_UNCOMPRESSED_URL.to_string()
}

fn default_verse_text() -> String {
    VERSE_TEXT_URL.to_string()
}

fn default_chapters() -> String {
    CHAPTERS_URL.to_string()
}

fn default_chapters_uncompressed() -> String {
    CHAPTERS_UNCOMPRESSED_URL.to_string()
}

fn default_chapter_text() -> String {
    CHAPTER_TEXT_URL.to_string()
}

/// Model-backed embedding provider settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Load the model in the background at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_model_name")]
    pub name: String,

    /// Stored vector width after Matryoshka truncation
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_query_prefix")]
    pub query_prefix: String,

    #[serde(default = "default_document_prefix")]
    pub document_prefix: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_model_name(),
            dimensions: DEFAULT_DIMENSIONS,
            query_prefix: default_query_prefix(),
            document_prefix: default_document_prefix(),
            max_tokens: MAX_TOKENS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_model_name() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_query_prefix() -> String {
    QUERY_PREFIX.to_string()
}

fn default_document_prefix() -> String {
    DOCUMENT_PREFIX.to_string()
}

fn default_max_tokens() -> usize {
    MAX_TOKENS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Store int8 codes instead of float32 vectors
    #[serde(default)]
    pub quantized: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Keep fetched payloads under `<data-dir>/cache`
    #[serde(default = "default_true")]
    pub disk_cache: bool,
    /// Granularities loaded at startup, in order
    #[serde(default = "default_preload")]
    pub preload: Vec<Granularity>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            corpus: CorpusConfig::default(),
            model: ModelConfig::default(),
            index: IndexConfig::default(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            disk_cache: true,
            preload: default_preload(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_preload() -> Vec<Granularity> {
    vec![Granularity::Verse, Granularity::Chapter]
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.model.dimensions == 0 {
            bail!("model.dimensions must be greater than 0");
        }

        if self.model.max_tokens == 0 {
            bail!("model.max_tokens must be greater than 0");
        }

        if self.model.download_timeout_secs == 0 {
            bail!("model.download_timeout_secs must be greater than 0");
        }

        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be greater than 0");
        }

        for granularity in Granularity::ALL {
            let urls = self.corpus.urls_for(granularity);
            if urls.embeddings.is_empty() || urls.text.is_empty() {
                bail!("corpus URLs for {granularity} must not be empty");
            }
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to create data dir {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store
                .write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())
                .context("failed to write default config")?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store
            .write(CONFIG_FILE, config_str.as_bytes())
            .context("failed to save config")
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_path.join("cache")
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
