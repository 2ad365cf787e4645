//! Text → vector providers and the model-backed encoder.
//!
//! - [`EmbeddingProvider`]: the capability every link of the chain implements
//! - [`TextEncoder`]: opaque inference, prefixed text in, full-width vector out
//! - [`FastembedEncoder`]: production encoder on top of fastembed
//! - [`ModelProvider`]: background-initialised provider with Matryoshka truncation

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

/// Stored and query vector dimensions.
pub const DEFAULT_DIMENSIONS: usize = 128;

/// Prefix telling the model it is embedding a search query.
pub const QUERY_PREFIX: &str = "task: search result | query: ";

/// Prefix telling the model it is embedding a passage.
pub const DOCUMENT_PREFIX: &str = "title: none | text: ";

/// Token budget per input; longer inputs are truncated by the tokenizer.
pub const MAX_TOKENS: usize = 512;

/// Model the hosted corpus vectors were produced with; queries must share its space.
pub const DEFAULT_MODEL: &str = "embeddinggemma-300m";

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Model is not ready")]
    NotReady,

    #[error("Provider has no corpus data yet")]
    NotPrimed,

    #[error("No similar passages found")]
    NoMatches,

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Every embedding provider failed")]
    ChainExhausted,
}

/// Something that turns text into a fixed-length vector.
///
/// Implementations report failure through `Err` so a chain can move on to
/// the next provider.
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Opaque inference capability.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// fastembed's TextEmbedding behind a Mutex, since embed() needs &mut self.
pub struct FastembedEncoder {
    model: Mutex<TextEmbedding>,
}

impl FastembedEncoder {
    /// Load `model_name`, downloading it into `cache_dir/models` on first use.
    ///
    /// Inputs longer than `max_tokens` are truncated by the tokenizer.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        max_tokens: usize,
    ) -> Result<Self, EmbeddingError> {
        let models_dir = cache_dir.join("models");
        let options = Self::init_options(model_name, models_dir.clone(), max_tokens)?;

        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let model =
            TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            model: Mutex::new(model),
        })
    }

    fn init_options(
        model_name: &str,
        models_dir: PathBuf,
        max_tokens: usize,
    ) -> Result<InitOptions, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        Ok(InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_max_length(max_tokens)
            .with_show_download_progress(true))
    }

    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "embeddinggemma-300m"
            | "embeddinggemma300m"
            | "onnx-community/embeddinggemma-300m-onnx" => {
                Ok(fastembed::EmbeddingModel::EmbeddingGemma300M)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1.5" | "nomicembedtextv15" => {
                Ok(fastembed::EmbeddingModel::NomicEmbedTextV15)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: embeddinggemma-300m, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1.5",
                name
            ))),
        }
    }
}

impl TextEncoder for FastembedEncoder {
    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::Inference(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Inference("No embedding returned".to_string()))
    }
}

/// Keep the first `dimensions` components without renormalizing.
pub fn matryoshka_truncate(
    mut vector: Vec<f32>,
    dimensions: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    if vector.len() < dimensions {
        return Err(EmbeddingError::Inference(format!(
            "model returned {} dimensions, need at least {}",
            vector.len(),
            dimensions
        )));
    }
    vector.truncate(dimensions);
    Ok(vector)
}

/// Externally visible lifecycle of the model-backed provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

enum ModelState {
    Uninitialized,
    Initializing,
    Ready(Arc<dyn TextEncoder>),
    Failed(String),
}

/// Primary provider. Skipped by the chain until its encoder is ready.
pub struct ModelProvider {
    state: RwLock<ModelState>,
    dimensions: usize,
    query_prefix: String,
    document_prefix: String,
}

impl ModelProvider {
    pub fn new(
        dimensions: usize,
        query_prefix: impl Into<String>,
        document_prefix: impl Into<String>,
    ) -> Self {
        Self {
            state: RwLock::new(ModelState::Uninitialized),
            dimensions,
            query_prefix: query_prefix.into(),
            document_prefix: document_prefix.into(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ModelState::Uninitialized => Readiness::Uninitialized,
            ModelState::Initializing => Readiness::Initializing,
            ModelState::Ready(_) => Readiness::Ready,
            ModelState::Failed(_) => Readiness::Failed,
        }
    }

    /// Reason for the last failed initialization.
    pub fn failure(&self) -> Option<String> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ModelState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Run `init` and record the outcome.
    ///
    /// Only the first call leaves `Uninitialized`; later calls return
    /// immediately without running `init`.
    pub fn initialize_with<F>(&self, init: F) -> Result<(), EmbeddingError>
    where
        F: FnOnce() -> Result<Arc<dyn TextEncoder>, EmbeddingError>,
    {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*state, ModelState::Uninitialized) {
                return Ok(());
            }
            *state = ModelState::Initializing;
        }

        log::info!("model initialization started");
        let outcome = init();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(encoder) => {
                log::info!("model initialization finished outcome=ready");
                *state = ModelState::Ready(encoder);
                Ok(())
            }
            Err(e) => {
                log::warn!("model initialization finished outcome=failed err={e}");
                *state = ModelState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Initialize on a dedicated thread; searches keep running meanwhile.
    pub fn spawn_initializer<F>(self: &Arc<Self>, init: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Result<Arc<dyn TextEncoder>, EmbeddingError> + Send + 'static,
    {
        let provider = Arc::clone(self);
        std::thread::spawn(move || {
            // outcome is recorded in the state and already logged
            let _ = provider.initialize_with(init);
        })
    }

    fn embed_with_prefix(&self, prefix: &str, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let encoder = match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            ModelState::Ready(encoder) => Arc::clone(encoder),
            _ => return Err(EmbeddingError::NotReady),
        };

        let full = encoder.encode(&format!("{prefix}{text}"))?;
        matryoshka_truncate(full, self.dimensions)
    }
}

impl EmbeddingProvider for ModelProvider {
    fn name(&self) -> &'static str {
        "model"
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_with_prefix(&self.query_prefix, text)
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_with_prefix(&self.document_prefix, text)
    }
}
