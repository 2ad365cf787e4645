//! Ordered fallback across embedding providers.

use std::sync::Arc;

use crate::semantic::embeddings::{
    EmbeddingError, EmbeddingProvider, ModelProvider, DOCUMENT_PREFIX, QUERY_PREFIX,
};
use crate::semantic::fallback::{HashProvider, PrecomputedProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Query,
    Document,
}

/// Tries each provider in order and returns the first vector produced.
///
/// The standard chain is model → precomputed → hash. The hash provider is
/// total, so a standard chain never returns `ChainExhausted`.
pub struct EmbeddingChain {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    precomputed: Option<Arc<PrecomputedProvider>>,
    dimensions: usize,
}

impl EmbeddingChain {
    /// Standard chain with the default prefixes.
    pub fn standard(dimensions: usize, model: Option<Arc<ModelProvider>>) -> Self {
        Self::with_prefixes(dimensions, model, QUERY_PREFIX, DOCUMENT_PREFIX)
    }

    pub fn with_prefixes(
        dimensions: usize,
        model: Option<Arc<ModelProvider>>,
        query_prefix: &str,
        document_prefix: &str,
    ) -> Self {
        let precomputed = Arc::new(PrecomputedProvider::new(dimensions));

        let mut providers: Vec<Arc<dyn EmbeddingProvider>> = Vec::with_capacity(3);
        if let Some(model) = model {
            providers.push(model);
        }
        providers.push(precomputed.clone());
        providers.push(Arc::new(HashProvider::new(
            dimensions,
            query_prefix,
            document_prefix,
        )));

        Self {
            providers,
            precomputed: Some(precomputed),
            dimensions,
        }
    }

    /// Chain over arbitrary providers, tried in the given order.
    pub fn from_providers(dimensions: usize, providers: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            providers,
            precomputed: None,
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Provider that gets primed with verse data once it is loaded.
    pub fn precomputed(&self) -> Option<&Arc<PrecomputedProvider>> {
        self.precomputed.as_ref()
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.dispatch(Purpose::Query, text)
    }

    pub fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.dispatch(Purpose::Document, text)
    }

    fn dispatch(&self, purpose: Purpose, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        for provider in &self.providers {
            let outcome = match purpose {
                Purpose::Query => provider.embed_query(text),
                Purpose::Document => provider.embed_document(text),
            };

            match outcome {
                Ok(vector) => {
                    log::debug!(
                        "provider={} purpose={purpose:?} outcome=ok",
                        provider.name()
                    );
                    return Ok(vector);
                }
                Err(EmbeddingError::NotReady) | Err(EmbeddingError::NotPrimed) => {
                    log::debug!("provider={} outcome=skipped", provider.name());
                }
                Err(e) => {
                    log::warn!("provider={} outcome=fallthrough err={e}", provider.name());
                }
            }
        }

        Err(EmbeddingError::ChainExhausted)
    }
}
