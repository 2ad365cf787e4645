//! Process-lifetime memo of fetched corpus payloads.
//!
//! Keyed by source URL. There is no TTL and no eviction: the corpus is a
//! handful of immutable files, so every entry stays valid until exit.
//! Anything serving a changing or unbounded set of URLs needs a bound here.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::semantic::corpus::LoadError;

#[derive(Default)]
pub struct PayloadCache {
    entries: RwLock<HashMap<String, Arc<Value>>>,
}

impl PayloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached payload for `url`, if it was fetched before.
    pub fn get(&self, url: &str) -> Option<Arc<Value>> {
        // entries are never mutated in place, so a poisoned map is still consistent
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(url).cloned()
    }

    /// Return the cached payload, or run `fetch` once and remember its result.
    ///
    /// The fetch runs without holding the lock. If two callers race on the
    /// same URL the first stored payload wins and both get that one.
    pub fn get_or_fetch<F>(&self, url: &str, fetch: F) -> Result<Arc<Value>, LoadError>
    where
        F: FnOnce(&str) -> Result<Value, LoadError>,
    {
        if let Some(cached) = self.get(url) {
            log::debug!("cache hit url={url}");
            return Ok(cached);
        }

        let fetched = Arc::new(fetch(url)?);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.entry(url.to_string()).or_insert(fetched).clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
