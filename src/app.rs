use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::config::Config;
use crate::semantic::{
    CorpusSource, EmbeddingChain, FastembedEncoder, Granularity, HttpCorpusSource, ModelProvider,
    Readiness, SearchService, TextEncoder,
};
use crate::storage;

const READINESS_POLL: Duration = Duration::from_millis(100);

/// Wires config, providers and the search service together.
pub struct App {
    config: Config,
    service: Arc<SearchService>,
    model: Option<Arc<ModelProvider>>,
}

impl App {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let disk = if config.disk_cache {
            let cache_dir = config.cache_dir();
            let store = storage::BackendLocal::new(&cache_dir)
                .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;
            Some(store)
        } else {
            None
        };

        let source = Arc::new(
            HttpCorpusSource::new(config.fetch_timeout(), disk)
                .context("failed to build HTTP client")?,
        );
        Ok(Self::with_source(config, source))
    }

    /// Build the app around any payload source.
    pub fn with_source(config: Config, source: Arc<dyn CorpusSource>) -> Self {
        let model_config = &config.model;

        let model = model_config.enabled.then(|| {
            Arc::new(ModelProvider::new(
                model_config.dimensions,
                model_config.query_prefix.clone(),
                model_config.document_prefix.clone(),
            ))
        });

        let chain = Arc::new(EmbeddingChain::with_prefixes(
            model_config.dimensions,
            model.clone(),
            &model_config.query_prefix,
            &model_config.document_prefix,
        ));

        let service = Arc::new(SearchService::new(
            chain,
            source,
            config.corpus.all_urls(),
            config.index.quantized,
        ));

        Self {
            config,
            service,
            model,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &Arc<SearchService> {
        &self.service
    }

    /// Start loading the model in the background. `None` when the model is disabled.
    pub fn start_model(&self) -> Option<JoinHandle<()>> {
        let model = self.model.as_ref()?;
        let name = self.config.model.name.clone();
        let max_tokens = self.config.model.max_tokens;
        let cache_dir = self.config.base_path().to_path_buf();

        log::info!("model={name} loading in background");
        Some(model.spawn_initializer(move || {
            let encoder = FastembedEncoder::new(&name, cache_dir, max_tokens)?;
            Ok(Arc::new(encoder) as Arc<dyn TextEncoder>)
        }))
    }

    /// Block until the model is ready, failed, or the download timeout passes.
    ///
    /// Call after [`App::start_model`]; an unstarted model just waits out the timeout.
    pub fn wait_for_model(&self) -> Option<Readiness> {
        let model = self.model.as_ref()?;
        let deadline =
            Instant::now() + Duration::from_secs(self.config.model.download_timeout_secs);

        loop {
            let readiness = model.readiness();
            match readiness {
                Readiness::Ready => return Some(readiness),
                Readiness::Failed => {
                    let reason = model.failure().unwrap_or_default();
                    log::warn!("model unavailable, using fallback providers: {reason}");
                    return Some(readiness);
                }
                _ if Instant::now() >= deadline => {
                    log::warn!("model not ready after timeout, using fallback providers");
                    return Some(readiness);
                }
                _ => std::thread::sleep(READINESS_POLL),
            }
        }
    }

    /// Configured granularities, verse first, without duplicates.
    pub fn preload_order(&self) -> Vec<Granularity> {
        let mut order = self.config.preload.clone();
        order.sort();
        order.dedup();
        order
    }

    /// Load the configured granularities on a background thread.
    pub fn spawn_preload(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let order = self.preload_order();

        std::thread::spawn(move || {
            for granularity in order {
                if let Err(e) = service.preload(granularity) {
                    log::error!("preload failed granularity={granularity} err={e}");
                }
            }
        })
    }

    /// Load the configured granularities on the calling thread.
    pub fn preload_all(&self) -> anyhow::Result<()> {
        for granularity in self.preload_order() {
            self.service
                .preload(granularity)
                .with_context(|| format!("failed to load {granularity}"))?;
        }
        Ok(())
    }
}
